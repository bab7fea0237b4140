
use crate::config::CoreConfig;
use crate::conversations::EventRow;
use crate::error::CoreError;
use crate::fallback::{filter_matches, HttpFallback, InMemoryFallback};
use crate::health::RelayHealthRecord;
use crate::outbox::OutboxRecord;
use crate::policy::Policy;
use crate::scheduler::ManualScheduler;
use crate::signer::Signer;
use crate::store::MemoryTable;
use crate::transport::{SocketChannels, SocketConnector};
use crate::{Messenger, MessengerDeps};
use courier_api::{normalize_relay_url, Filter, SignedEvent, KIND_CLIENT_AUTH, KIND_ENCRYPTED_DM};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

pub const START_MS: u64 = 1_700_000_000_000;
pub const RELAY_A: &str = "wss://relay-a.test";
pub const RELAY_B: &str = "wss://relay-b.test";
pub const RELAY_C: &str = "wss://relay-c.test";

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

pub fn key(c: char) -> String {
    c.to_string().repeat(64)
}

pub fn owner_key() -> String {
    key('a')
}

pub fn peer_key() -> String {
    key('b')
}

pub fn next_event_id() -> String {
    format!("{:064x}", NEXT_EVENT.fetch_add(1, Ordering::SeqCst))
}

/// Event from `from` to `to` sealed the way [`FakeSigner`] seals.
pub fn sealed_event(from: &str, to: &str, plaintext: &str, created_at: u64) -> SignedEvent {
    SignedEvent {
        id: next_event_id(),
        pubkey: from.to_string(),
        created_at,
        kind: KIND_ENCRYPTED_DM,
        tags: vec![vec!["p".to_string(), to.to_string()]],
        content: format!("enc:{}", plaintext),
        sig: "c".repeat(128),
    }
}

#[derive(Clone)]
pub struct FakeSigner {
    pubkey: Option<String>,
    failing: Arc<AtomicBool>,
    undecryptable: Arc<AtomicBool>,
    built: Arc<AtomicU64>,
}

impl FakeSigner {
    pub fn new(pubkey: &str) -> Self {
        Self {
            pubkey: Some(pubkey.to_string()),
            failing: Arc::new(AtomicBool::new(false)),
            undecryptable: Arc::new(AtomicBool::new(false)),
            built: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn without_key() -> Self {
        Self {
            pubkey: None,
            ..Self::new("")
        }
    }

    pub fn fail_builds(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }

    pub fn fail_decrypts(&self, on: bool) {
        self.undecryptable.store(on, Ordering::SeqCst);
    }

    pub fn built(&self) -> u64 {
        self.built.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Signer for FakeSigner {
    fn public_key(&self) -> Option<String> {
        self.pubkey.clone()
    }

    async fn build_event(
        &self,
        recipient: &str,
        plaintext: &str,
        kind: u32,
    ) -> Result<SignedEvent, CoreError> {
        let pubkey = self.pubkey.clone().ok_or(CoreError::SignerUnavailable)?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(CoreError::Encryption(
                "recipient key is malformed".to_string(),
            ));
        }
        self.built.fetch_add(1, Ordering::SeqCst);
        let mut event = sealed_event(&pubkey, recipient, plaintext, START_MS / 1000);
        event.kind = kind;
        Ok(event)
    }

    async fn build_auth_event(
        &self,
        challenge: &str,
        relay_url: &str,
    ) -> Result<SignedEvent, CoreError> {
        let pubkey = self.pubkey.clone().ok_or(CoreError::SignerUnavailable)?;
        Ok(SignedEvent {
            id: next_event_id(),
            pubkey,
            created_at: START_MS / 1000,
            kind: KIND_CLIENT_AUTH,
            tags: vec![
                vec!["relay".to_string(), relay_url.to_string()],
                vec!["challenge".to_string(), challenge.to_string()],
            ],
            content: String::new(),
            sig: "d".repeat(128),
        })
    }

    async fn decrypt(&self, _counterparty: &str, ciphertext: &str) -> Result<String, CoreError> {
        if self.undecryptable.load(Ordering::SeqCst) {
            return Err(CoreError::Encryption(
                "shared secret unavailable".to_string(),
            ));
        }
        ciphertext
            .strip_prefix("enc:")
            .map(|plain| plain.to_string())
            .ok_or_else(|| CoreError::Encryption("not sealed".to_string()))
    }
}

/// How a fake relay answers the next `EVENT` it receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Reject(String),
    /// Stores the event but never answers.
    Silent,
    /// Answers with a NOTICE naming the event instead of an OK.
    Notice(String),
}

#[derive(Default)]
struct RelayState {
    replies: VecDeque<Reply>,
    default_reply: Option<Reply>,
    refuse: bool,
    challenge: Option<String>,
    stored: Vec<SignedEvent>,
    published: Vec<String>,
    auths: u32,
    connects: u32,
    reqs: u32,
    socket: Option<AbortHandle>,
}

/// Scripted in-process relays reachable through [`SocketConnector`].
#[derive(Clone, Default)]
pub struct FakeRelays {
    relays: Arc<Mutex<HashMap<String, RelayState>>>,
}

impl FakeRelays {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, url: &str, apply: impl FnOnce(&mut RelayState) -> T) -> T {
        let mut guard = self.relays.lock().expect("relays");
        apply(guard.entry(normalize_relay_url(url)).or_default())
    }

    pub fn script(&self, url: &str, replies: Vec<Reply>) {
        self.with(url, |relay| relay.replies.extend(replies));
    }

    pub fn set_default(&self, url: &str, reply: Reply) {
        self.with(url, |relay| relay.default_reply = Some(reply));
    }

    pub fn refuse(&self, url: &str, on: bool) {
        self.with(url, |relay| relay.refuse = on);
    }

    /// Sends an AUTH challenge as soon as a socket opens.
    pub fn require_auth(&self, url: &str, challenge: &str) {
        self.with(url, |relay| relay.challenge = Some(challenge.to_string()));
    }

    pub fn store(&self, url: &str, event: SignedEvent) {
        self.with(url, |relay| relay.stored.push(event));
    }

    pub fn published(&self, url: &str) -> Vec<String> {
        self.with(url, |relay| relay.published.clone())
    }

    pub fn connects(&self, url: &str) -> u32 {
        self.with(url, |relay| relay.connects)
    }

    pub fn reqs(&self, url: &str) -> u32 {
        self.with(url, |relay| relay.reqs)
    }

    pub fn auths(&self, url: &str) -> u32 {
        self.with(url, |relay| relay.auths)
    }

    /// Closes the relay side of the current socket.
    pub fn drop_socket(&self, url: &str) {
        if let Some(socket) = self.with(url, |relay| relay.socket.take()) {
            socket.abort();
        }
    }

    fn respond(&self, url: &str, text: &str) -> Vec<String> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => return Vec::new(),
        };
        let parts = match value.as_array() {
            Some(parts) => parts.clone(),
            None => return Vec::new(),
        };
        let kind = parts.first().and_then(|k| k.as_str()).unwrap_or_default();
        match kind {
            "EVENT" => {
                let event: SignedEvent = match parts.get(1).cloned().map(serde_json::from_value) {
                    Some(Ok(event)) => event,
                    _ => return Vec::new(),
                };
                self.with(url, |relay| {
                    relay.published.push(event.id.clone());
                    let reply = relay
                        .replies
                        .pop_front()
                        .or_else(|| relay.default_reply.clone())
                        .unwrap_or(Reply::Accept);
                    match reply {
                        Reply::Accept => {
                            relay.stored.push(event.clone());
                            vec![json!(["OK", event.id, true, ""]).to_string()]
                        }
                        Reply::Reject(reason) => {
                            vec![json!(["OK", event.id, false, reason]).to_string()]
                        }
                        Reply::Silent => {
                            relay.stored.push(event.clone());
                            Vec::new()
                        }
                        Reply::Notice(message) => {
                            vec![json!(["NOTICE", format!("{}: {}", message, event.id)]).to_string()]
                        }
                    }
                })
            }
            "REQ" => {
                let sub_id = parts
                    .get(1)
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string();
                let filters: Vec<Filter> = parts
                    .iter()
                    .skip(2)
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect();
                self.with(url, |relay| {
                    relay.reqs += 1;
                    let mut frames: Vec<String> = relay
                        .stored
                        .iter()
                        .filter(|event| filter_matches(&filters, event))
                        .map(|event| json!(["EVENT", sub_id, event]).to_string())
                        .collect();
                    frames.push(json!(["EOSE", sub_id]).to_string());
                    frames
                })
            }
            "AUTH" => {
                let id = parts
                    .get(1)
                    .and_then(|e| e.get("id"))
                    .and_then(|id| id.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.with(url, |relay| relay.auths += 1);
                vec![json!(["OK", id, true, ""]).to_string()]
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait::async_trait]
impl SocketConnector for FakeRelays {
    async fn connect(&self, url: &str) -> Result<SocketChannels, CoreError> {
        let (refuse, challenge) = self.with(url, |relay| {
            relay.connects += 1;
            (relay.refuse, relay.challenge.clone())
        });
        if refuse {
            return Err(CoreError::Transport("connection refused".to_string()));
        }
        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();
        let (relay_tx, relay_rx) = mpsc::unbounded_channel::<String>();
        if let Some(challenge) = challenge {
            let _ = relay_tx.send(json!(["AUTH", challenge]).to_string());
        }
        let relays = self.clone();
        let key = normalize_relay_url(url);
        let task = tokio::spawn(async move {
            while let Some(text) = client_rx.recv().await {
                for frame in relays.respond(&key, &text) {
                    if relay_tx.send(frame).is_err() {
                        return;
                    }
                }
            }
        });
        self.with(url, |relay| relay.socket = Some(task.abort_handle()));
        Ok(SocketChannels {
            outgoing: client_tx,
            incoming: relay_rx,
        })
    }
}

pub fn base_config(relays: &[&str]) -> CoreConfig {
    CoreConfig {
        relays: relays.iter().map(|r| r.to_string()).collect(),
        min_publish_relays: 1,
        quorum_threshold: 1,
        poll_interval_ms: 0,
        ws_ack_timeout_ms: 500,
        http_ack_timeout_ms: 500,
        request_timeout_ms: 500,
        ..CoreConfig::default()
    }
}

pub fn test_policy() -> Policy {
    Policy {
        backoff_base_ms: 1_000,
        backoff_max_ms: 60_000,
        jitter_ratio: 0.0,
        max_attempts: 6,
        pump_interval_ms: 0,
        reconnect_base_ms: 500,
        reconnect_max_ms: 8_000,
        confirm_timeout_ms: 200,
    }
}

pub struct Harness {
    pub messenger: Messenger,
    pub relays: FakeRelays,
    pub scheduler: ManualScheduler,
    pub signer: FakeSigner,
    pub fallback: InMemoryFallback,
    pub outbox: MemoryTable<OutboxRecord>,
    pub events: MemoryTable<EventRow>,
    pub health: MemoryTable<RelayHealthRecord>,
}

pub async fn harness(config: CoreConfig, policy: Policy, with_fallback: bool) -> Harness {
    harness_with(config, policy, with_fallback, FakeSigner::new(&owner_key())).await
}

pub async fn harness_with(
    config: CoreConfig,
    policy: Policy,
    with_fallback: bool,
    signer: FakeSigner,
) -> Harness {
    let relays = FakeRelays::new();
    let scheduler = ManualScheduler::starting_at(START_MS);
    let fallback = InMemoryFallback::new();
    let outbox: MemoryTable<OutboxRecord> = MemoryTable::new();
    let events: MemoryTable<EventRow> = MemoryTable::new();
    let health: MemoryTable<RelayHealthRecord> = MemoryTable::new();
    let fallback_dep: Option<Arc<dyn HttpFallback>> = if with_fallback {
        Some(Arc::new(fallback.clone()) as Arc<dyn HttpFallback>)
    } else {
        None
    };
    let deps = MessengerDeps {
        signer: Arc::new(signer.clone()),
        connector: Arc::new(relays.clone()),
        fallback: fallback_dep,
        outbox: Arc::new(outbox.clone()),
        events: Arc::new(events.clone()),
        health: Arc::new(health.clone()),
        scheduler: Arc::new(scheduler.clone()),
    };
    let messenger = Messenger::init(config, policy, deps).await.expect("init");
    Harness {
        messenger,
        relays,
        scheduler,
        signer,
        fallback,
        outbox,
        events,
        health,
    }
}

/// Lets spawned relay and reader tasks run to quiescence.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
