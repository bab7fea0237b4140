use courier_api::normalize_hex_key;
use courier_core::config::{CoreConfig, SignerMode, TransportMode};
use courier_core::policy::Policy;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable consulted when `[identity] secret_key_hex` is absent.
pub const SECRET_KEY_ENV: &str = "COURIER_SECRET_KEY";

#[derive(Clone, Debug, Deserialize)]
pub struct CourierConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub relays: RelaysConfig,
    #[serde(default)]
    pub delivery: Policy,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub signer_mode: SignerMode,
    #[serde(default)]
    pub secret_key_hex: Option<String>,
}

impl IdentityConfig {
    /// Configured key, falling back to [`SECRET_KEY_ENV`].
    pub fn secret_key(&self) -> Option<String> {
        self.secret_key_hex
            .clone()
            .or_else(|| std::env::var(SECRET_KEY_ENV).ok())
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RelaysConfig {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub vetted: Vec<String>,
    #[serde(default = "default_min_publish")]
    pub min_publish: usize,
    #[serde(default)]
    pub http_fallback_base: Option<String>,
    #[serde(default)]
    pub transport_mode: TransportMode,
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default = "default_quorum")]
    pub quorum_threshold: u32,
    #[serde(default = "default_ws_ack_timeout")]
    pub ws_ack_timeout_ms: u64,
    #[serde(default = "default_http_ack_timeout")]
    pub http_ack_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_echo_timeout")]
    pub echo_timeout_ms: u64,
    #[serde(default = "default_enabled")]
    pub durable_outbox: bool,
    #[serde(default)]
    pub http: HttpClientConfig,
}

impl Default for RelaysConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            vetted: Vec::new(),
            min_publish: default_min_publish(),
            http_fallback_base: None,
            transport_mode: TransportMode::Ws,
            require_auth: false,
            quorum_threshold: default_quorum(),
            ws_ack_timeout_ms: default_ws_ack_timeout(),
            http_ack_timeout_ms: default_http_ack_timeout(),
            request_timeout_ms: default_request_timeout(),
            poll_interval_ms: default_poll_interval(),
            echo_timeout_ms: default_echo_timeout(),
            durable_outbox: true,
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct HttpClientConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("api.bind_addr {}", self.bind_addr)))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".courier")
}

fn default_min_publish() -> usize {
    2
}

fn default_quorum() -> u32 {
    2
}

fn default_ws_ack_timeout() -> u64 {
    4_000
}

fn default_http_ack_timeout() -> u64 {
    8_000
}

fn default_request_timeout() -> u64 {
    4_000
}

fn default_poll_interval() -> u64 {
    15_000
}

fn default_echo_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    3_000
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_retry_backoff() -> u64 {
    250
}

fn default_bind_addr() -> String {
    "127.0.0.1:9181".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid: {0}")]
    Invalid(String),
}

impl CourierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for url in self.relays.urls.iter().chain(self.relays.vetted.iter()) {
            let parsed = url::Url::parse(url)
                .map_err(|_| ConfigError::Invalid(format!("relay url {}", url)))?;
            if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
                return Err(ConfigError::Invalid(format!("relay url {} must be ws(s)", url)));
            }
        }
        if let Some(base) = self.relays.http_fallback_base.as_ref() {
            let parsed = url::Url::parse(base)
                .map_err(|_| ConfigError::Invalid(format!("http_fallback_base {}", base)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(ConfigError::Invalid(format!(
                    "http_fallback_base {} must be http(s)",
                    base
                )));
            }
        }
        if self.relays.transport_mode == TransportMode::Http
            && self.relays.http_fallback_base.is_none()
        {
            return Err(ConfigError::Invalid(
                "http transport requires http_fallback_base".to_string(),
            ));
        }
        if self.relays.quorum_threshold == 0 {
            return Err(ConfigError::Invalid("quorum_threshold must be >= 1".to_string()));
        }
        if self.identity.signer_mode == SignerMode::Software {
            let key = self
                .identity
                .secret_key()
                .ok_or_else(|| ConfigError::Invalid("software signer needs a secret key".to_string()))?;
            if normalize_hex_key(&key).is_none() {
                return Err(ConfigError::Invalid("secret key must be 64 hex chars".to_string()));
            }
        }
        if self.api.enabled {
            let addr = self.api.socket_addr()?;
            if !addr.ip().is_loopback() {
                return Err(ConfigError::Invalid(format!(
                    "api.bind_addr {} must be loopback",
                    addr
                )));
            }
        }
        Ok(())
    }

    pub fn to_core_config(&self) -> CoreConfig {
        CoreConfig {
            relays: self.relays.urls.clone(),
            vetted_relays: self.relays.vetted.clone(),
            min_publish_relays: self.relays.min_publish,
            http_fallback_base: self.relays.http_fallback_base.clone(),
            transport_mode: self.relays.transport_mode.clone(),
            signer_mode: self.identity.signer_mode.clone(),
            require_auth: self.relays.require_auth,
            ws_ack_timeout_ms: self.relays.ws_ack_timeout_ms,
            http_ack_timeout_ms: self.relays.http_ack_timeout_ms,
            request_timeout_ms: self.relays.request_timeout_ms,
            poll_interval_ms: self.relays.poll_interval_ms,
            quorum_threshold: self.relays.quorum_threshold,
            echo_timeout_ms: self.relays.echo_timeout_ms,
            durable_outbox: self.relays.durable_outbox,
            ..CoreConfig::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<CourierConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let cfg: CourierConfig =
        toml::from_str(&content).map_err(|err| ConfigError::Parse(err.to_string()))?;
    cfg.validate()?;
    Ok(cfg)
}
