use super::*;
use crate::clients::relay_http::{error_message, should_retry_status};
use courier_api::{Filter, SignedEvent, KIND_ENCRYPTED_DM};
use courier_core::config::CoreConfig;
use courier_core::transport::SocketConnector;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct BridgeServer {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    shutdown: oneshot::Sender<()>,
}

async fn stored_event() -> SignedEvent {
    let alice = SoftwareSigner::from_hex(ALICE_SECRET).unwrap();
    let bob = SoftwareSigner::from_hex(BOB_SECRET).unwrap();
    alice
        .build_event(bob.public_hex(), "from the bridge", KIND_ENCRYPTED_DM)
        .await
        .unwrap()
}

fn reply(status: StatusCode, content_type: &str, body: String) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::from(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
    resp
}

async fn bridge_route(
    req: Request<Incoming>,
    stored: SignedEvent,
    hits: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    hits.fetch_add(1, Ordering::SeqCst);
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    match (method.as_str(), path.as_str()) {
        ("GET", "/req") if query.contains("filters=") => Ok(reply(
            StatusCode::OK,
            "application/json",
            serde_json::json!({ "events": [stored] }).to_string(),
        )),
        ("GET", "/plain/req") => Ok(reply(
            StatusCode::OK,
            "text/html",
            "<html>maintenance</html>".to_string(),
        )),
        ("GET", "/busy/req") | ("POST", "/busy/event") => Ok(reply(
            StatusCode::SERVICE_UNAVAILABLE,
            "text/plain",
            "try later".to_string(),
        )),
        ("POST", "/event") => {
            let body = req.into_body().collect().await?.to_bytes();
            let event: SignedEvent = match serde_json::from_slice(&body) {
                Ok(event) => event,
                Err(_) => {
                    return Ok(reply(StatusCode::BAD_REQUEST, "text/plain", "bad json".to_string()))
                }
            };
            if event.content.is_empty() {
                return Ok(reply(
                    StatusCode::BAD_REQUEST,
                    "application/json",
                    serde_json::json!({"error": {"code": "invalid", "message": "empty content"}})
                        .to_string(),
                ));
            }
            Ok(reply(
                StatusCode::OK,
                "application/json",
                serde_json::json!({"accepted": true, "message": "stored"}).to_string(),
            ))
        }
        _ => Ok(reply(StatusCode::NOT_FOUND, "text/plain", "not found".to_string())),
    }
}

async fn spawn_bridge() -> Option<BridgeServer> {
    let listener = match TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await {
        Ok(listener) => listener,
        Err(_) => return None,
    };
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let stored = stored_event().await;
    let (tx, mut rx) = oneshot::channel::<()>();
    let server_hits = hits.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut rx => break,
                res = listener.accept() => {
                    let (stream, _) = match res {
                        Ok(accepted) => accepted,
                        Err(_) => break,
                    };
                    let stored = stored.clone();
                    let hits = server_hits.clone();
                    tokio::spawn(async move {
                        let service = service_fn(move |req: Request<Incoming>| {
                            bridge_route(req, stored.clone(), hits.clone())
                        });
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), service)
                            .await;
                    });
                }
            }
        }
    });
    Some(BridgeServer {
        addr,
        hits,
        shutdown: tx,
    })
}

fn client_for(base: String) -> RelayHttpClient {
    let cfg = CoreConfig {
        http_fallback_base: Some(base),
        http_ack_timeout_ms: 2_000,
        ..CoreConfig::default()
    };
    let http = HttpClientConfig {
        connect_timeout_ms: 1_000,
        retry_attempts: 1,
        retry_backoff_ms: 10,
    };
    RelayHttpClient::new(&cfg, &http).unwrap()
}

#[test]
fn retry_statuses_match_transient_failures() {
    assert!(should_retry_status(StatusCode::INTERNAL_SERVER_ERROR));
    assert!(should_retry_status(StatusCode::BAD_GATEWAY));
    assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
    assert!(should_retry_status(StatusCode::REQUEST_TIMEOUT));
    assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    assert!(!should_retry_status(StatusCode::NOT_FOUND));
    assert!(!should_retry_status(StatusCode::OK));
}

#[test]
fn error_messages_are_extracted_from_known_shapes() {
    assert_eq!(
        error_message(r#"{"error":{"code":"rate_limited","message":"slow down"}}"#).as_deref(),
        Some("rate_limited: slow down")
    );
    assert_eq!(
        error_message(r#"{"error":{"message":"bad sig"}}"#).as_deref(),
        Some("bad sig")
    );
    assert_eq!(error_message(r#"{"message":"nope"}"#).as_deref(), Some("nope"));
    assert_eq!(error_message("gateway down").as_deref(), Some("gateway down"));
    assert_eq!(error_message("  "), None);
}

#[test]
fn client_needs_a_fallback_base() {
    let http = HttpClientConfig::default();
    assert!(matches!(
        RelayHttpClient::new(&CoreConfig::default(), &http),
        Err(CoreError::Validation(_))
    ));
}

#[tokio::test]
async fn bridge_query_and_publish() {
    let Some(server) = spawn_bridge().await else {
        return;
    };
    let client = client_for(format!("http://{}/", server.addr));
    assert_eq!(client.endpoint(), format!("http://{}", server.addr));

    let stored = stored_event().await;
    let found = client.query(&[Filter::by_id(&stored.id)]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].pubkey, stored.pubkey);

    let ack = client.publish(&stored).await.unwrap();
    assert!(ack.accepted);
    assert_eq!(ack.reason.as_deref(), Some("stored"));

    let mut empty = stored.clone();
    empty.content.clear();
    let rejected = client.publish(&empty).await.unwrap();
    assert!(!rejected.accepted);
    assert_eq!(rejected.reason.as_deref(), Some("invalid: empty content"));
    let _ = server.shutdown.send(());
}

#[tokio::test]
async fn non_json_query_counts_as_empty() {
    let Some(server) = spawn_bridge().await else {
        return;
    };
    let client = client_for(format!("http://{}/plain", server.addr));
    let found = client
        .query(&[Filter::inbox(&"a".repeat(64), KIND_ENCRYPTED_DM, None)])
        .await
        .unwrap();
    assert!(found.is_empty());
    let _ = server.shutdown.send(());
}

#[tokio::test]
async fn unavailable_bridge_is_retried_then_transient() {
    let Some(server) = spawn_bridge().await else {
        return;
    };
    let client = client_for(format!("http://{}/busy", server.addr));
    let stored = stored_event().await;
    let err = client.publish(&stored).await.unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
    assert!(err.is_retryable());
    assert_eq!(server.hits.load(Ordering::SeqCst), 2);
    let _ = server.shutdown.send(());
}

#[tokio::test]
async fn websocket_connector_bridges_text_frames() {
    let listener = match TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await {
        Ok(listener) => listener,
        Err(_) => return,
    };
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                if let WsMessage::Text(text) = frame {
                    let _ = ws.send(WsMessage::Text(format!("echo:{}", text))).await;
                }
            }
        }
    });

    let connector = WsConnector::new(Duration::from_secs(2));
    let mut channels = connector.connect(&format!("ws://{}", addr)).await.unwrap();
    channels.outgoing.send("[\"REQ\",\"s1\",{}]".to_string()).unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(2), channels.incoming.recv())
        .await
        .unwrap();
    assert_eq!(echoed.as_deref(), Some("echo:[\"REQ\",\"s1\",{}]"));

    // Dropping the sender closes the socket and ends the incoming stream.
    drop(channels.outgoing);
    let closed = tokio::time::timeout(Duration::from_secs(2), channels.incoming.recv())
        .await
        .unwrap();
    assert!(closed.is_none());
}

#[tokio::test]
async fn websocket_connector_reports_refused_connections() {
    let listener = match TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await {
        Ok(listener) => listener,
        Err(_) => return,
    };
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let connector = WsConnector::new(Duration::from_secs(2));
    let result = connector.connect(&format!("ws://{}", addr)).await;
    assert!(matches!(
        result,
        Err(CoreError::Transport(_)) | Err(CoreError::Timeout(_))
    ));
}
