use super::*;
use crate::config::{
    ApiConfig, HttpClientConfig, IdentityConfig, LoggingConfig, RelaysConfig,
};
use courier_core::config::TransportMode;
use courier_core::policy::Policy;
use hyper::client::conn::http1 as client_http1;
use hyper::server::conn::http1 as server_http1;
use serde_json::Value;
use tempfile::tempdir;
use tokio::io::duplex;

mod clients_tests;

pub(super) const ALICE_SECRET: &str =
    "0000000000000000000000000000000000000000000000000000000000000003";
pub(super) const BOB_SECRET: &str =
    "0000000000000000000000000000000000000000000000000000000000000005";

#[tokio::test]
async fn config_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("courier.toml");
    let cfg = format!(
        r#"
data_dir = "{dir}"

[identity]
signer_mode = "software"
secret_key_hex = "{key}"

[relays]
urls = ["wss://relay.one", "wss://relay.two"]
vetted = ["wss://relay.vetted"]
http_fallback_base = "https://bridge.example.com/api/"
transport_mode = "ws"
quorum_threshold = 1

[relays.http]
retry_attempts = 3

[delivery]
max_attempts = 4
backoff_base_ms = 100

[api]
bind_addr = "127.0.0.1:0"

[logging]
level = "debug"
"#,
        dir = dir.path().display(),
        key = ALICE_SECRET
    );
    std::fs::write(&path, cfg).unwrap();
    let loaded = config::load_config(&path).unwrap();
    assert_eq!(loaded.relays.urls.len(), 2);
    assert_eq!(loaded.relays.http.retry_attempts, 3);
    assert_eq!(loaded.relays.http.retry_backoff_ms, 250);
    assert_eq!(loaded.delivery.max_attempts, 4);
    assert_eq!(loaded.delivery.pump_interval_ms, Policy::default().pump_interval_ms);
    assert_eq!(loaded.logging.level, "debug");

    let core = loaded.to_core_config();
    assert_eq!(core.quorum_threshold, 1);
    assert_eq!(core.vetted_relays, vec!["wss://relay.vetted".to_string()]);
    assert_eq!(
        core.http_event_url().as_deref(),
        Some("https://bridge.example.com/api/event")
    );
    assert_eq!(core.echo_timeout_ms, 5_000);
}

#[tokio::test]
async fn daemon_starts_and_stops() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let (addr, tx, handle) = start_server(state.clone()).await;
    assert!(addr.is_some() || addr.is_none());
    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    state.messenger.shutdown().await;
}

#[tokio::test]
async fn control_api_reports_health_and_status() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let (addr, tx, handle) = start_server(state.clone()).await;

    let health = dispatch_request(state.clone(), addr, build_request("GET", "/health", None)).await;
    assert_eq!(health.status(), StatusCode::OK);
    assert_eq!(body_json(health).await["status"], "ok");

    let status = dispatch_request(state.clone(), addr, build_request("GET", "/status", None)).await;
    assert_eq!(status.status(), StatusCode::OK);
    let body = body_json(status).await;
    let alice = SoftwareSigner::from_hex(ALICE_SECRET).unwrap();
    assert_eq!(body["owner"], alice.public_hex());
    assert_eq!(body["transport_mode"], "offline");
    assert_eq!(body["pending_outbox"], 0);
    assert_eq!(body["pending_decrypts"], 0);

    let missing = dispatch_request(state.clone(), addr, build_request("GET", "/nope", None)).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    state.messenger.shutdown().await;
}

#[tokio::test]
async fn send_queues_into_the_outbox_and_conversation() {
    let cfg = test_config();
    let state = build_state(&cfg).await;
    let (addr, tx, handle) = start_server(state.clone()).await;
    let bob = SoftwareSigner::from_hex(BOB_SECRET).unwrap();

    let sent = dispatch_request(
        state.clone(),
        addr,
        build_request(
            "POST",
            "/send",
            Some(serde_json::json!({"recipient": bob.public_hex(), "content": "hello bob"})),
        ),
    )
    .await;
    assert_eq!(sent.status(), StatusCode::ACCEPTED);
    let local_id = body_json(sent).await["local_id"]
        .as_str()
        .unwrap()
        .to_string();

    let outbox = dispatch_request(state.clone(), addr, build_request("GET", "/outbox", None)).await;
    let records = body_json(outbox).await;
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], local_id.as_str());
    assert_eq!(records[0]["recipient"], bob.public_hex());

    let path = format!("/conversations/{}", bob.public_hex());
    let conversation = dispatch_request(state.clone(), addr, build_request("GET", &path, None)).await;
    assert_eq!(conversation.status(), StatusCode::OK);
    let messages = body_json(conversation).await;
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "hello bob");

    let listed = dispatch_request(state.clone(), addr, build_request("GET", "/conversations", None)).await;
    assert_eq!(body_json(listed).await.as_array().unwrap().len(), 1);

    let retried = dispatch_request(
        state.clone(),
        addr,
        build_request("POST", &format!("/retry/{}", local_id), None),
    )
    .await;
    assert_eq!(retried.status(), StatusCode::ACCEPTED);

    let _ = tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    state.messenger.shutdown().await;
}

#[tokio::test]
async fn bad_requests_are_reported() {
    let cfg = test_config();
    let state = build_state(&cfg).await;

    let bad_recipient = send_in_memory_request(
        state.clone(),
        build_request(
            "POST",
            "/send",
            Some(serde_json::json!({"recipient": "not-a-key", "content": "hi"})),
        ),
    )
    .await;
    assert_eq!(bad_recipient.status(), StatusCode::BAD_REQUEST);

    let bad_body = send_in_memory_request(
        state.clone(),
        build_request("POST", "/send", Some(serde_json::json!({"to": "x"}))),
    )
    .await;
    assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);

    let unknown = send_in_memory_request(
        state.clone(),
        build_request("POST", "/retry/unknown-id", None),
    )
    .await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    state.messenger.shutdown().await;
}

#[tokio::test]
async fn read_only_daemon_refuses_to_send() {
    let mut cfg = test_config();
    cfg.identity.signer_mode = SignerMode::None;
    cfg.identity.secret_key_hex = None;
    let state = build_state(&cfg).await;
    let bob = SoftwareSigner::from_hex(BOB_SECRET).unwrap();
    let resp = send_in_memory_request(
        state.clone(),
        build_request(
            "POST",
            "/send",
            Some(serde_json::json!({"recipient": bob.public_hex(), "content": "hi"})),
        ),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    state.messenger.shutdown().await;
}

pub(super) fn test_config() -> CourierConfig {
    #[allow(deprecated)]
    CourierConfig {
        data_dir: tempdir().unwrap().into_path(),
        identity: IdentityConfig {
            signer_mode: SignerMode::Software,
            secret_key_hex: Some(ALICE_SECRET.to_string()),
        },
        relays: RelaysConfig {
            urls: vec!["wss://relay.one".to_string()],
            transport_mode: TransportMode::Offline,
            quorum_threshold: 1,
            http: HttpClientConfig::default(),
            ..RelaysConfig::default()
        },
        delivery: Policy::default(),
        api: ApiConfig {
            enabled: true,
            bind_addr: "127.0.0.1:0".to_string(),
        },
        logging: LoggingConfig {
            level: "error".to_string(),
        },
    }
}

pub(super) async fn build_state(cfg: &CourierConfig) -> DaemonState {
    init_logging(cfg);
    let messenger = init_messenger(cfg).await.unwrap();
    DaemonState { messenger }
}

pub(super) async fn start_server(
    state: DaemonState,
) -> (Option<SocketAddr>, oneshot::Sender<()>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel();
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    let (addr, handle) = start_control_server(state, addr, rx).await.unwrap();
    (addr, tx, handle)
}

pub(super) fn build_request(
    method: &str,
    path: &str,
    body: Option<serde_json::Value>,
) -> Request<Full<Bytes>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("host", "localhost");
    if body.is_some() {
        builder = builder.header(CONTENT_TYPE, "application/json");
    }
    let bytes = body
        .map(|value| value.to_string().into_bytes())
        .unwrap_or_default();
    builder.body(Full::from(Bytes::from(bytes))).unwrap()
}

pub(super) async fn body_json(resp: Response<Incoming>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub(super) async fn dispatch_request(
    state: DaemonState,
    addr: Option<SocketAddr>,
    req: Request<Full<Bytes>>,
) -> Response<Incoming> {
    if let Some(addr) = addr {
        return send_request(addr, req).await;
    }
    send_in_memory_request(state, req).await
}

async fn send_request(addr: SocketAddr, req: Request<Full<Bytes>>) -> Response<Incoming> {
    let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let io = TokioIo::new(stream);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    sender.send_request(req).await.unwrap()
}

async fn send_in_memory_request(state: DaemonState, req: Request<Full<Bytes>>) -> Response<Incoming> {
    let (client, server) = duplex(16 * 1024);
    let server_state = state.clone();
    let service = service_fn(move |incoming: Request<Incoming>| {
        let inner = server_state.clone();
        async move { handle_request(inner, incoming).await }
    });
    tokio::spawn(async move {
        let io = TokioIo::new(server);
        let _ = server_http1::Builder::new().serve_connection(io, service).await;
    });
    let io = TokioIo::new(client);
    let (mut sender, connection) = client_http1::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    sender.send_request(req).await.unwrap()
}
