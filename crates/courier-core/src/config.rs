use courier_api::{normalize_relay_url, KIND_ENCRYPTED_DM};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Ws,
    Http,
    Offline,
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Ws
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignerMode {
    Extension,
    Software,
    None,
}

impl Default for SignerMode {
    fn default() -> Self {
        SignerMode::Software
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub relays: Vec<String>,
    pub vetted_relays: Vec<String>,
    pub min_publish_relays: usize,
    pub http_fallback_base: Option<String>,
    pub transport_mode: TransportMode,
    pub signer_mode: SignerMode,
    pub require_auth: bool,
    pub auth_cache_ms: u64,
    pub ws_ack_timeout_ms: u64,
    pub http_ack_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub quorum_threshold: u32,
    pub echo_timeout_ms: u64,
    pub durable_outbox: bool,
    pub event_kind: u32,
    pub max_content_bytes: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            vetted_relays: Vec::new(),
            min_publish_relays: 2,
            http_fallback_base: None,
            transport_mode: TransportMode::Ws,
            signer_mode: SignerMode::Software,
            require_auth: false,
            auth_cache_ms: 300_000,
            ws_ack_timeout_ms: 4_000,
            http_ack_timeout_ms: 8_000,
            request_timeout_ms: 4_000,
            poll_interval_ms: 15_000,
            quorum_threshold: 2,
            echo_timeout_ms: 5_000,
            durable_outbox: true,
            event_kind: KIND_ENCRYPTED_DM,
            max_content_bytes: 256 * 1024,
        }
    }
}

impl CoreConfig {
    pub fn http_event_url(&self) -> Option<String> {
        self.fallback_base().map(|base| format!("{}/event", base))
    }

    pub fn http_req_url(&self) -> Option<String> {
        self.fallback_base().map(|base| format!("{}/req", base))
    }

    fn fallback_base(&self) -> Option<String> {
        self.http_fallback_base
            .as_ref()
            .map(|base| base.trim().trim_end_matches('/').to_string())
            .filter(|base| !base.is_empty())
    }

    pub fn uses_websocket(&self) -> bool {
        self.transport_mode == TransportMode::Ws
    }
}

/// Splits a comma separated relay list, dropping blanks and repeats.
pub fn parse_relay_list(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for entry in raw.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        let normalized = normalize_relay_url(trimmed);
        if !out
            .iter()
            .any(|existing| normalize_relay_url(existing) == normalized)
        {
            out.push(trimmed.to_string());
        }
    }
    out
}
