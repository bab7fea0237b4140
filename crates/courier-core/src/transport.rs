use crate::error::CoreError;
use crate::event::{CourierEvent, EventBus};
use crate::fallback::HttpFallback;
use crate::policy::Policy;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::signer::Signer;
use courier_api::{event_id_in_notice, ClientFrame, Filter, RelayAck, RelayFrame, SignedEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Both halves of an open socket. Dropping `outgoing` closes the socket; the
/// socket closing ends `incoming`.
pub struct SocketChannels {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

#[async_trait::async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketChannels, CoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

pub fn composite_status(socket: SocketStatus, pool: PoolStatus) -> RelayStatus {
    match (socket, pool) {
        (SocketStatus::Connected, _) => RelayStatus::Connected,
        (SocketStatus::Reconnecting, _) => RelayStatus::Reconnecting,
        (SocketStatus::Connecting, _) => RelayStatus::Connecting,
        (_, PoolStatus::Connected) => RelayStatus::Connected,
        (_, PoolStatus::Connecting) => RelayStatus::Connecting,
        _ => RelayStatus::Disconnected,
    }
}

/// `min(base * 2^(attempt-1), max)`. No jitter.
pub fn reconnect_delay(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = attempt.max(1).saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << exponent).min(max_ms)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionMessage {
    Event(SignedEvent),
    Eose,
    Closed(Option<String>),
}

pub struct Subscription {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<SubscriptionMessage>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Closed,
    Opening,
    Open,
}

struct SubEntry {
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<SubscriptionMessage>,
}

type AckResult = Result<RelayAck, CoreError>;

struct State {
    phase: Phase,
    pool: PoolStatus,
    generation: u64,
    attempts: u32,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    reader: Option<AbortHandle>,
    reconnect: Option<TimerHandle>,
    subs: HashMap<String, SubEntry>,
    pending: HashMap<String, oneshot::Sender<AckResult>>,
    open_waiters: Vec<oneshot::Sender<bool>>,
    challenge: Option<String>,
    challenge_waiters: Vec<oneshot::Sender<String>>,
    authed_at: Option<u64>,
    users: u32,
    /// Set once a caller asked for the socket to go away when unused.
    close_when_idle: bool,
}

impl State {
    fn socket_status(&self) -> SocketStatus {
        match self.phase {
            Phase::Open => SocketStatus::Connected,
            Phase::Opening if self.attempts > 0 => SocketStatus::Reconnecting,
            Phase::Opening => SocketStatus::Connecting,
            Phase::Closed if self.reconnect.is_some() => SocketStatus::Reconnecting,
            Phase::Closed => SocketStatus::Disconnected,
        }
    }

    fn idle(&self) -> bool {
        self.subs.is_empty() && self.pending.is_empty() && self.users == 0
    }

    fn send(&self, frame: &ClientFrame) -> bool {
        match self.outgoing.as_ref() {
            Some(tx) => tx.send(frame.to_json()).is_ok(),
            None => false,
        }
    }
}

struct Inner {
    url: String,
    connector: Arc<dyn SocketConnector>,
    scheduler: Arc<dyn Scheduler>,
    reconnect_base_ms: u64,
    reconnect_max_ms: u64,
    events: EventBus,
    status_tx: watch::Sender<RelayStatus>,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct RelayTransport {
    inner: Arc<Inner>,
}

impl RelayTransport {
    pub fn new(
        url: &str,
        connector: Arc<dyn SocketConnector>,
        scheduler: Arc<dyn Scheduler>,
        policy: &Policy,
        events: EventBus,
    ) -> Self {
        let (status_tx, _) = watch::channel(RelayStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                url: url.to_string(),
                connector,
                scheduler,
                reconnect_base_ms: policy.reconnect_base_ms,
                reconnect_max_ms: policy.reconnect_max_ms,
                events,
                status_tx,
                state: Mutex::new(State {
                    phase: Phase::Closed,
                    pool: PoolStatus::Disconnected,
                    generation: 0,
                    attempts: 0,
                    outgoing: None,
                    reader: None,
                    reconnect: None,
                    subs: HashMap::new(),
                    pending: HashMap::new(),
                    open_waiters: Vec::new(),
                    challenge: None,
                    challenge_waiters: Vec::new(),
                    authed_at: None,
                    users: 0,
                    close_when_idle: false,
                }),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn status(&self) -> RelayStatus {
        *self.inner.status_tx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RelayStatus> {
        self.inner.status_tx.subscribe()
    }

    pub async fn socket_status(&self) -> SocketStatus {
        self.inner.state.lock().await.socket_status()
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.state.lock().await.subs.len()
    }

    pub async fn set_pool_status(&self, pool: PoolStatus) {
        let mut state = self.inner.state.lock().await;
        state.pool = pool;
        self.publish_status(&state);
    }

    pub async fn connect(&self) -> Result<(), CoreError> {
        let generation = {
            let mut state = self.inner.state.lock().await;
            if state.phase != Phase::Closed {
                return Ok(());
            }
            if let Some(timer) = state.reconnect.take() {
                timer.cancel();
            }
            state.phase = Phase::Opening;
            state.generation += 1;
            self.publish_status(&state);
            state.generation
        };
        log::debug!("opening relay connection {}", self.inner.url);
        match self.inner.connector.connect(&self.inner.url).await {
            Ok(channels) => {
                self.on_open(generation, channels).await;
                Ok(())
            }
            Err(err) => {
                log::warn!("relay connection {} failed: {}", self.inner.url, err);
                self.on_close(generation).await;
                Err(err)
            }
        }
    }

    pub async fn subscribe(&self, filters: Vec<Filter>) -> Subscription {
        let id = format!("courier-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.state.lock().await;
            if state.phase == Phase::Open {
                state.send(&ClientFrame::Req {
                    sub_id: id.clone(),
                    filters: filters.clone(),
                });
            }
            state.close_when_idle = false;
            state.subs.insert(id.clone(), SubEntry { filters, tx });
        }
        if let Err(err) = self.connect().await {
            log::debug!("subscription {} waiting for reconnect: {}", id, err);
        }
        Subscription { id, events: rx }
    }

    pub async fn unsubscribe(&self, sub_id: &str) {
        let mut state = self.inner.state.lock().await;
        if state.subs.remove(sub_id).is_some() && state.phase == Phase::Open {
            state.send(&ClientFrame::Close(sub_id.to_string()));
        }
        if state.subs.is_empty() {
            state.close_when_idle = true;
            self.close_if_idle(&mut state);
        }
        self.publish_status(&state);
    }

    /// Keeps the socket up until the matching `release`.
    pub async fn retain(&self) {
        self.inner.state.lock().await.users += 1;
    }

    /// Ends a `retain`. The socket is closed once nothing else uses it.
    pub async fn release(&self) {
        let mut state = self.inner.state.lock().await;
        state.users = state.users.saturating_sub(1);
        state.close_when_idle = true;
        self.close_if_idle(&mut state);
        self.publish_status(&state);
    }

    async fn end_use(&self) {
        let mut state = self.inner.state.lock().await;
        state.users = state.users.saturating_sub(1);
        if state.close_when_idle {
            self.close_if_idle(&mut state);
            self.publish_status(&state);
        }
    }

    fn close_if_idle(&self, state: &mut State) {
        if !state.idle() {
            return;
        }
        if state.phase != Phase::Closed || state.reconnect.is_some() {
            log::info!("relay connection {} idle, tearing down", self.inner.url);
        }
        teardown_locked(state, "relay connection torn down");
    }

    pub async fn publish(
        &self,
        event: &SignedEvent,
        timeout: Duration,
    ) -> Result<RelayAck, CoreError> {
        if courier_api::normalize_hex_key(&event.id).is_none() {
            return Ok(RelayAck::rejected("invalid event identifier"));
        }
        self.retain().await;
        let result = match self.ensure_open(timeout).await {
            Ok(()) => {
                self.send_and_await(ClientFrame::Event(event.clone()), &event.id, timeout)
                    .await
            }
            Err(err) => Err(err),
        };
        self.end_use().await;
        result
    }

    /// One-shot query. Falls back to `fallback` when the socket returns nothing or fails.
    pub async fn request_once(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
        fallback: Option<&dyn HttpFallback>,
    ) -> Result<Vec<SignedEvent>, CoreError> {
        let ws = self.request_via_socket(filters.clone(), timeout).await;
        let fallback = match fallback {
            Some(fallback) => fallback,
            None => return ws,
        };
        if let Ok(events) = ws.as_ref() {
            if !events.is_empty() {
                return ws;
            }
        }
        match fallback.query(&filters).await {
            Ok(events) if !events.is_empty() => Ok(events),
            Ok(_) => ws,
            Err(err) => {
                log::warn!("fallback query for {} failed: {}", self.inner.url, err);
                match ws {
                    Ok(events) => Ok(events),
                    Err(ws_err) => Err(ws_err),
                }
            }
        }
    }

    /// NIP-42 challenge response. A fresh success is reused for `cache_ms`.
    pub async fn authenticate(
        &self,
        signer: &dyn Signer,
        required: bool,
        cache_ms: u64,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        self.retain().await;
        let result = self
            .answer_challenge(signer, required, cache_ms, timeout)
            .await;
        self.end_use().await;
        result
    }

    async fn answer_challenge(
        &self,
        signer: &dyn Signer,
        required: bool,
        cache_ms: u64,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        self.ensure_open(timeout).await?;
        let now = self.inner.scheduler.now_ms();
        let waiting = {
            let mut state = self.inner.state.lock().await;
            if let Some(at) = state.authed_at {
                if now.saturating_sub(at) < cache_ms {
                    return Ok(());
                }
            }
            match state.challenge.clone() {
                Some(challenge) => Ok(challenge),
                None if !required => return Ok(()),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.challenge_waiters.push(tx);
                    Err(rx)
                }
            }
        };
        let challenge = match waiting {
            Ok(challenge) => challenge,
            Err(rx) => match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(challenge)) => challenge,
                _ => {
                    return Err(CoreError::Transport(format!(
                        "{} did not issue an auth challenge",
                        self.inner.url
                    )))
                }
            },
        };
        let event = signer.build_auth_event(&challenge, &self.inner.url).await?;
        let ack = self
            .send_and_await(ClientFrame::Auth(event.clone()), &event.id, timeout)
            .await?;
        if !ack.accepted {
            let reason = ack.reason.unwrap_or_else(|| "auth rejected".to_string());
            return Err(CoreError::rejection(&self.inner.url, &reason));
        }
        let mut state = self.inner.state.lock().await;
        state.authed_at = Some(now);
        log::debug!("authenticated to {}", self.inner.url);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.subs.clear();
        teardown_locked(&mut state, "relay transport shut down");
        self.publish_status(&state);
    }

    async fn ensure_open(&self, timeout: Duration) -> Result<(), CoreError> {
        if let Err(err) = self.connect().await {
            return Err(CoreError::Transport(format!(
                "relay socket unavailable: {}",
                err
            )));
        }
        let rx = {
            let mut state = self.inner.state.lock().await;
            match state.phase {
                Phase::Open => return Ok(()),
                Phase::Closed => {
                    return Err(CoreError::Transport("relay socket unavailable".to_string()))
                }
                Phase::Opening => {
                    let (tx, rx) = oneshot::channel();
                    state.open_waiters.push(tx);
                    rx
                }
            }
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(_) => Err(CoreError::Transport(
                "relay socket closed before opening".to_string(),
            )),
            Err(_) => Err(CoreError::Timeout("waiting for relay socket".to_string())),
        }
    }

    async fn send_and_await(
        &self,
        frame: ClientFrame,
        event_id: &str,
        timeout: Duration,
    ) -> Result<RelayAck, CoreError> {
        let key = event_id.to_lowercase();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            state.pending.insert(key.clone(), tx);
            if !state.send(&frame) {
                state.pending.remove(&key);
                return Err(CoreError::Transport(
                    "failed to send frame over relay socket".to_string(),
                ));
            }
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Transport(
                "relay socket closed before acknowledgement".to_string(),
            )),
            Err(_) => {
                self.inner.state.lock().await.pending.remove(&key);
                log::warn!("relay ack timeout for event {} on {}", key, self.inner.url);
                Err(CoreError::Timeout("waiting for relay OK".to_string()))
            }
        }
    }

    async fn request_via_socket(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Result<Vec<SignedEvent>, CoreError> {
        self.retain().await;
        let result = self.collect_once(filters, timeout).await;
        self.end_use().await;
        result
    }

    async fn collect_once(
        &self,
        filters: Vec<Filter>,
        timeout: Duration,
    ) -> Result<Vec<SignedEvent>, CoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.ensure_open(timeout).await?;
        let mut sub = self.subscribe(filters).await;
        let mut events: Vec<SignedEvent> = Vec::new();
        loop {
            match tokio::time::timeout_at(deadline, sub.events.recv()).await {
                Ok(Some(SubscriptionMessage::Event(event))) => {
                    if !events.iter().any(|existing| existing.id == event.id) {
                        events.push(event);
                    }
                }
                Ok(Some(SubscriptionMessage::Eose))
                | Ok(Some(SubscriptionMessage::Closed(_)))
                | Ok(None) => break,
                Err(_) => break,
            }
        }
        self.unsubscribe(&sub.id).await;
        Ok(events)
    }

    async fn on_open(&self, generation: u64, channels: SocketChannels) {
        let mut state = self.inner.state.lock().await;
        if state.generation != generation || state.phase != Phase::Opening {
            return;
        }
        log::info!("relay connection opened {}", self.inner.url);
        state.phase = Phase::Open;
        state.attempts = 0;
        if let Some(timer) = state.reconnect.take() {
            timer.cancel();
        }
        state.outgoing = Some(channels.outgoing);
        let replay: Vec<ClientFrame> = state
            .subs
            .iter()
            .map(|(sub_id, entry)| ClientFrame::Req {
                sub_id: sub_id.clone(),
                filters: entry.filters.clone(),
            })
            .collect();
        for frame in replay.iter() {
            state.send(frame);
        }
        for waiter in state.open_waiters.drain(..) {
            let _ = waiter.send(true);
        }
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(read_loop(weak, generation, channels.incoming));
        state.reader = Some(handle.abort_handle());
        self.publish_status(&state);
    }

    async fn on_close(&self, generation: u64) {
        let mut state = self.inner.state.lock().await;
        if state.generation != generation {
            return;
        }
        log::info!("relay connection closed {}", self.inner.url);
        state.phase = Phase::Closed;
        state.outgoing = None;
        state.reader = None;
        reset_session(&mut state, "relay socket closed before acknowledgement");
        if !state.subs.is_empty() {
            self.schedule_reconnect(&mut state);
        }
        self.publish_status(&state);
    }

    fn schedule_reconnect(&self, state: &mut State) {
        if state.reconnect.is_some() {
            return;
        }
        state.attempts = state.attempts.max(1);
        let delay = reconnect_delay(
            state.attempts,
            self.inner.reconnect_base_ms,
            self.inner.reconnect_max_ms,
        );
        log::info!(
            "scheduling relay reconnect to {} in {}ms",
            self.inner.url,
            delay
        );
        let weak = Arc::downgrade(&self.inner);
        let timer = self.inner.scheduler.after(
            Duration::from_millis(delay),
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    RelayTransport { inner }.reconnect_now().await;
                }
            }),
        );
        state.reconnect = Some(timer);
    }

    async fn reconnect_now(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.reconnect.take().is_none() {
                return;
            }
            state.attempts += 1;
        }
        if let Err(err) = self.connect().await {
            log::debug!("reconnect to {} failed: {}", self.inner.url, err);
        }
    }

    async fn handle_text(&self, generation: u64, text: &str) {
        let frame = match RelayFrame::parse(text) {
            Some(frame) => frame,
            None => {
                log::debug!("ignoring unrecognised relay frame from {}", self.inner.url);
                return;
            }
        };
        let mut state = self.inner.state.lock().await;
        if state.generation != generation {
            return;
        }
        match frame {
            RelayFrame::Event { sub_id, event } => {
                if let Some(entry) = state.subs.get(&sub_id) {
                    let _ = entry.tx.send(SubscriptionMessage::Event(event));
                }
            }
            RelayFrame::Eose(sub_id) => {
                if let Some(entry) = state.subs.get(&sub_id) {
                    let _ = entry.tx.send(SubscriptionMessage::Eose);
                }
            }
            RelayFrame::Closed { sub_id, message } => {
                if let Some(entry) = state.subs.remove(&sub_id) {
                    let _ = entry.tx.send(SubscriptionMessage::Closed(message));
                }
            }
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => match state.pending.remove(&event_id) {
                Some(waiter) => {
                    let reason = message.filter(|m| !m.is_empty());
                    if accepted {
                        log::debug!("relay {} accepted event {}", self.inner.url, event_id);
                    } else {
                        log::warn!(
                            "relay {} rejected event {}: {}",
                            self.inner.url,
                            event_id,
                            reason.as_deref().unwrap_or("no reason")
                        );
                    }
                    let _ = waiter.send(Ok(RelayAck { accepted, reason }));
                }
                None => log::debug!("relay OK for unknown event {}", event_id),
            },
            RelayFrame::Notice(message) => {
                let pending = event_id_in_notice(&message).and_then(|id| state.pending.remove(&id));
                match pending {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(RelayAck::rejected(message)));
                    }
                    None => log::warn!("relay NOTICE from {}: {}", self.inner.url, message),
                }
            }
            RelayFrame::Auth(challenge) => {
                state.authed_at = None;
                for waiter in state.challenge_waiters.drain(..) {
                    let _ = waiter.send(challenge.clone());
                }
                state.challenge = Some(challenge);
            }
        }
    }

    fn publish_status(&self, state: &State) {
        let next = composite_status(state.socket_status(), state.pool);
        let changed = self.inner.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            self.inner.events.publish(CourierEvent::RelayStatus {
                relay: self.inner.url.clone(),
                status: next,
            });
        }
    }
}

fn reset_session(state: &mut State, reason: &str) {
    state.challenge = None;
    state.authed_at = None;
    state.challenge_waiters.clear();
    for (_, waiter) in state.pending.drain() {
        let _ = waiter.send(Err(CoreError::Transport(reason.to_string())));
    }
    for waiter in state.open_waiters.drain(..) {
        let _ = waiter.send(false);
    }
}

fn teardown_locked(state: &mut State, reason: &str) {
    if let Some(timer) = state.reconnect.take() {
        timer.cancel();
    }
    if let Some(reader) = state.reader.take() {
        reader.abort();
    }
    state.outgoing = None;
    state.generation += 1;
    state.phase = Phase::Closed;
    state.attempts = 0;
    state.close_when_idle = false;
    reset_session(state, reason);
}

async fn read_loop(
    weak: Weak<Inner>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = incoming.recv().await {
        match weak.upgrade() {
            Some(inner) => {
                RelayTransport { inner }
                    .handle_text(generation, &text)
                    .await
            }
            None => return,
        }
    }
    if let Some(inner) = weak.upgrade() {
        RelayTransport { inner }.on_close(generation).await;
    }
}
