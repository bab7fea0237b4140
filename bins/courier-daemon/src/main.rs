mod clients;
mod config;
mod signer;

use bytes::Bytes;
use clients::{RelayHttpClient, WsConnector};
use config::CourierConfig;
use courier_core::config::SignerMode;
use courier_core::error::CoreError;
use courier_core::conversations::EventRow;
use courier_core::fallback::HttpFallback;
use courier_core::health::RelayHealthRecord;
use courier_core::outbox::{OutboxRecord, OutboxStatus};
use courier_core::scheduler::TokioScheduler;
use courier_core::signer::{NoSigner, Signer};
use courier_core::store::JsonFileTable;
use courier_core::{Messenger, MessengerDeps};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::LevelFilter;
use serde::Deserialize;
use signer::SoftwareSigner;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(thiserror::Error, Debug)]
enum DaemonError {
    #[error("config: {0}")]
    Config(#[from] config::ConfigError),
    #[error("core: {0}")]
    Core(#[from] CoreError),
}

#[derive(Clone)]
struct DaemonState {
    messenger: Messenger,
}

#[derive(Deserialize)]
struct SendRequest {
    recipient: String,
    content: String,
}

#[tokio::main]
async fn main() -> Result<(), DaemonError> {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--keygen") {
        let fresh = SoftwareSigner::generate();
        println!("secret_key_hex = \"{}\"", fresh.secret_hex());
        println!("# public key {}", fresh.public_hex());
        return Ok(());
    }
    let mut path = PathBuf::from("courier.toml");
    let mut i = 1;
    while i + 1 < args.len() {
        if args[i] == "--config" {
            path = PathBuf::from(&args[i + 1]);
        }
        i += 1;
    }
    let cfg = config::load_config(&path)?;
    init_logging(&cfg);
    let messenger = init_messenger(&cfg).await?;
    log::info!("courier daemon running as {}", messenger.owner().await);
    match messenger.start_inbox().await {
        Ok(count) => log::info!("inbox subscribed on {} relays", count),
        Err(err) => log::warn!("inbox not started: {}", err),
    }
    let state = DaemonState {
        messenger: messenger.clone(),
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = if cfg.api.enabled {
        let (addr, handle) = start_control_server(state, cfg.api.socket_addr()?, shutdown_rx).await?;
        if let Some(addr) = addr {
            log::info!("control api listening on {}", addr);
        }
        Some(handle)
    } else {
        None
    };
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let _ = ctrl_c.as_mut().await;
    let _ = shutdown_tx.send(());
    if let Some(server) = server {
        let _ = server.await;
    }
    messenger.shutdown().await;
    Ok(())
}

fn init_logging(cfg: &CourierConfig) {
    let level = match cfg.logging.level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => LevelFilter::Info,
    };
    let _ = env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init();
}

fn init_signer(cfg: &CourierConfig) -> Result<Arc<dyn Signer>, DaemonError> {
    match cfg.identity.signer_mode {
        SignerMode::Software => {
            let key = cfg.identity.secret_key().ok_or_else(|| {
                config::ConfigError::Invalid("software signer needs a secret key".to_string())
            })?;
            Ok(Arc::new(SoftwareSigner::from_hex(&key)?))
        }
        SignerMode::Extension => {
            log::warn!("extension signer is not available to the daemon, running read-only");
            Ok(Arc::new(NoSigner))
        }
        SignerMode::None => Ok(Arc::new(NoSigner)),
    }
}

async fn init_messenger(cfg: &CourierConfig) -> Result<Messenger, DaemonError> {
    let core_cfg = cfg.to_core_config();
    let data_dir = cfg.data_dir.clone();
    let fallback: Option<Arc<dyn HttpFallback>> = if core_cfg.http_fallback_base.is_some() {
        Some(Arc::new(RelayHttpClient::new(&core_cfg, &cfg.relays.http)?))
    } else {
        None
    };
    let outbox: JsonFileTable<OutboxRecord> = JsonFileTable::open(&data_dir, "outbox")?;
    let events: JsonFileTable<EventRow> = JsonFileTable::open(&data_dir, "events")?;
    let health: JsonFileTable<RelayHealthRecord> = JsonFileTable::open(&data_dir, "health")?;
    let deps = MessengerDeps {
        signer: init_signer(cfg)?,
        connector: Arc::new(WsConnector::new(Duration::from_millis(
            cfg.relays.http.connect_timeout_ms,
        ))),
        fallback,
        outbox: Arc::new(outbox),
        events: Arc::new(events),
        health: Arc::new(health),
        scheduler: Arc::new(TokioScheduler),
    };
    Ok(Messenger::init(core_cfg, cfg.delivery.clone(), deps).await?)
}

async fn start_control_server(
    state: DaemonState,
    addr: SocketAddr,
    shutdown: oneshot::Receiver<()>,
) -> Result<(Option<SocketAddr>, JoinHandle<()>), DaemonError> {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(err) => {
            log::warn!("control api bind {} failed: {}", addr, err);
            let handle = tokio::spawn(async move {
                let _ = shutdown.await;
            });
            return Ok((None, handle));
        }
    };
    let local = listener.local_addr().ok();
    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    break;
                }
                res = listener.accept() => {
                    match res {
                        Ok((stream, _)) => {
                            let state_clone = state.clone();
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let state = state_clone.clone();
                                    async move { handle_request(state, req).await }
                                });
                                let _ = http1::Builder::new().serve_connection(io, service).await;
                            });
                        }
                        Err(_) => break,
                    }
                }
            }
        }
    });
    Ok((local, handle))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, serde_json::json!({ "error": message }))
}

fn core_error_response(err: &CoreError) -> Response<Full<Bytes>> {
    let status = match err {
        CoreError::Validation(_) | CoreError::Encryption(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound => StatusCode::NOT_FOUND,
        CoreError::SignerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_value(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn handle_request(
    state: DaemonState,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let messenger = &state.messenger;
    match (method.as_str(), path.as_str()) {
        ("GET", "/health") => Ok(json_response(
            StatusCode::OK,
            serde_json::json!({"status":"ok"}),
        )),
        ("GET", "/status") => {
            let records = match messenger.outbox_snapshot().await {
                Ok(records) => records,
                Err(err) => return Ok(core_error_response(&err)),
            };
            let pending_outbox = records.iter().filter(|r| !r.status.is_terminal()).count();
            let failed_outbox = records
                .iter()
                .filter(|r| r.status == OutboxStatus::FailedPerm)
                .count();
            let body = serde_json::json!({
                "owner": messenger.owner().await,
                "transport_mode": messenger.config().transport_mode,
                "relays": messenger.relay_statuses().await,
                "pending_outbox": pending_outbox,
                "failed_outbox": failed_outbox,
                "pending_decrypts": messenger.pending_decrypt_count().await,
                "conversations": messenger.conversations().await.len(),
            });
            Ok(json_response(StatusCode::OK, body))
        }
        ("GET", "/outbox") => match messenger.outbox_snapshot().await {
            Ok(records) => Ok(to_json(&records)),
            Err(err) => Ok(core_error_response(&err)),
        },
        ("GET", "/relays") => match messenger.relay_health().await {
            Ok(records) => Ok(to_json(&records)),
            Err(err) => Ok(core_error_response(&err)),
        },
        ("GET", "/conversations") => Ok(to_json(&messenger.conversations().await)),
        ("GET", p) if p.starts_with("/conversations/") => {
            let key = p.trim_start_matches("/conversations/");
            if key.is_empty() {
                return Ok(error_response(StatusCode::BAD_REQUEST, "missing conversation"));
            }
            if let Err(err) = messenger.load_conversation(key).await {
                return Ok(core_error_response(&err));
            }
            Ok(to_json(&messenger.conversation(key).await))
        }
        ("POST", "/send") => {
            let body = req.into_body().collect().await?.to_bytes();
            let parsed: SendRequest = match serde_json::from_slice(&body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    return Ok(error_response(StatusCode::BAD_REQUEST, &err.to_string()))
                }
            };
            match messenger.send_dm(&parsed.recipient, &parsed.content).await {
                Ok(local_id) => Ok(json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({ "local_id": local_id }),
                )),
                Err(err) => Ok(core_error_response(&err)),
            }
        }
        ("POST", p) if p.starts_with("/retry/") => {
            let local_id = p.trim_start_matches("/retry/");
            match messenger.retry(local_id).await {
                Ok(()) => Ok(json_response(
                    StatusCode::ACCEPTED,
                    serde_json::json!({ "local_id": local_id }),
                )),
                Err(err) => Ok(core_error_response(&err)),
            }
        }
        _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
    }
}

#[cfg(test)]
mod tests;
