pub mod config;
pub mod conversations;
pub mod delivery;
pub mod echo;
pub mod error;
pub mod event;
pub mod fallback;
pub mod health;
pub mod merge;
pub mod message;
pub mod outbox;
pub mod policy;
pub mod pool;
pub mod scheduler;
pub mod signer;
pub mod store;
pub mod time;
pub mod transport;

use config::{CoreConfig, TransportMode};
use conversations::{ConversationMeta, ConversationStore, EventRow};
use courier_api::{
    normalize_hex_key, validate_content, validate_signed_event, Filter, RelayAck, SignedEvent,
};
use delivery::{DeliveryCoordinator, DeliveryReport, DeliveryVerdict};
use echo::{AckSource, EchoTransition, LocalEchoTracker};
use error::CoreError;
use event::{CourierEvent, DeliveryOutcome, EventBus, EventReceiver};
use fallback::HttpFallback;
use health::{select_publish_relays, RelayHealthRanker, RelayHealthRecord};
use merge::{MergeHit, MessageStore};
use message::{Direction, EchoStatus, LocalEchoMeta, Message, PayloadSnapshot};
use outbox::{OutboxPump, OutboxQueue, OutboxRecord, OutboxStatus};
use policy::Policy;
use pool::RelayPool;
use scheduler::{Scheduler, TimerHandle};
use signer::Signer;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::Table;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use transport::{RelayStatus, RelayTransport, SocketConnector, SubscriptionMessage};
use uuid::Uuid;

pub struct MessengerDeps {
    pub signer: Arc<dyn Signer>,
    pub connector: Arc<dyn SocketConnector>,
    pub fallback: Option<Arc<dyn HttpFallback>>,
    pub outbox: Arc<dyn Table<OutboxRecord>>,
    pub events: Arc<dyn Table<EventRow>>,
    pub health: Arc<dyn Table<RelayHealthRecord>>,
    pub scheduler: Arc<dyn Scheduler>,
}

struct EngineState {
    owner: String,
    store: MessageStore,
    echoes: LocalEchoTracker,
    metas: BTreeMap<String, ConversationMeta>,
    pending_decrypts: Vec<SignedEvent>,
    last_seen: u64,
    /// Sends whose current attempt series already produced a `DeliverySettled`.
    settled: HashSet<String>,
}

impl EngineState {
    fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            store: MessageStore::new(),
            echoes: LocalEchoTracker::new(),
            metas: BTreeMap::new(),
            pending_decrypts: Vec::new(),
            last_seen: 0,
            settled: HashSet::new(),
        }
    }

    fn meta_mut(&mut self, conversation: &str) -> &mut ConversationMeta {
        self.metas
            .entry(conversation.to_string())
            .or_insert_with(|| ConversationMeta::new(conversation))
    }
}

#[derive(Default)]
struct DirectSends {
    records: HashMap<String, OutboxRecord>,
    timers: HashMap<String, TimerHandle>,
}

impl DirectSends {
    fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.cancel();
        }
    }
}

struct InboxSubscription {
    transport: RelayTransport,
    sub_id: String,
    reader: AbortHandle,
}

#[derive(Clone)]
pub struct Messenger {
    config: CoreConfig,
    policy: Policy,
    signer: Arc<dyn Signer>,
    scheduler: Arc<dyn Scheduler>,
    pool: RelayPool,
    ranker: RelayHealthRanker,
    coordinator: DeliveryCoordinator,
    outbox: OutboxQueue,
    pump: OutboxPump,
    conversations: ConversationStore,
    events: EventBus,
    generation: Arc<AtomicU64>,
    state: Arc<Mutex<EngineState>>,
    direct: Arc<Mutex<DirectSends>>,
    inbox: Arc<Mutex<Vec<InboxSubscription>>>,
    workers: Arc<std::sync::Mutex<Vec<AbortHandle>>>,
}

impl Messenger {
    pub async fn init(
        config: CoreConfig,
        policy: Policy,
        deps: MessengerDeps,
    ) -> Result<Self, CoreError> {
        let events = EventBus::new(256);
        let pool = RelayPool::new(
            deps.connector.clone(),
            deps.scheduler.clone(),
            deps.fallback.clone(),
            policy.clone(),
            events.clone(),
        );
        let ranker = RelayHealthRanker::new(deps.health.clone());
        let coordinator = DeliveryCoordinator::new(
            config.clone(),
            policy.clone(),
            deps.signer.clone(),
            pool.clone(),
            ranker.clone(),
            deps.scheduler.clone(),
        );
        let owner = deps.signer.public_key().unwrap_or_default();
        let messenger = Self {
            config: config.clone(),
            policy: policy.clone(),
            signer: deps.signer.clone(),
            scheduler: deps.scheduler.clone(),
            pool,
            ranker,
            coordinator,
            outbox: OutboxQueue::new(deps.outbox.clone()),
            pump: OutboxPump::new(),
            conversations: ConversationStore::new(deps.events.clone()),
            events,
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(EngineState::new(&owner))),
            direct: Arc::new(Mutex::new(DirectSends::default())),
            inbox: Arc::new(Mutex::new(Vec::new())),
            workers: Arc::new(std::sync::Mutex::new(Vec::new())),
        };
        messenger.restore_owner(&owner).await?;
        if messenger.policy.pump_interval_ms > 0 {
            messenger.start_outbox_worker();
        }
        if messenger.config.poll_interval_ms > 0 && messenger.pool.fallback().is_some() {
            messenger.start_poller();
        }
        Ok(messenger)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn owner(&self) -> String {
        self.state.lock().await.owner.clone()
    }

    pub async fn send_dm(&self, recipient: &str, content: &str) -> Result<String, CoreError> {
        let recipient = normalize_hex_key(recipient)
            .ok_or_else(|| CoreError::Validation("recipient".to_string()))?;
        validate_content(content, self.config.max_content_bytes)
            .map_err(|err| CoreError::Validation(err.to_string()))?;
        let signer_key = self
            .signer
            .public_key()
            .ok_or(CoreError::SignerUnavailable)?;
        let owner = match self.owner().await {
            owner if owner.is_empty() => signer_key,
            owner => owner,
        };
        let now = self.scheduler.now_ms();
        let local_id = Uuid::new_v4().to_string();
        let (targets, appended) = select_publish_relays(
            &self.config.relays,
            &self.config.vetted_relays,
            self.config.min_publish_relays,
        );
        if !appended.is_empty() {
            log::debug!(
                "topped up publish targets with vetted relays {:?}",
                appended
            );
        }
        let payload = PayloadSnapshot::new(content);
        let message = Message::outgoing(&local_id, &recipient, payload.clone(), now);
        let meta = LocalEchoMeta::new(&local_id, payload.clone(), targets.clone(), now);
        let record = OutboxRecord::new(&local_id, &owner, &recipient, payload, targets, now);

        let timer = if self.config.durable_outbox {
            None
        } else {
            Some(self.arm_echo_timer(&local_id))
        };
        let (saved, meta_row) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let handle = state
                .echoes
                .schedule(&mut state.store, message, meta, timer, now);
            let conversation = state.meta_mut(&recipient);
            conversation.last_message_at = now;
            let meta_row = conversation.clone();
            (state.store.get(handle).cloned(), meta_row)
        };
        if let Some(saved) = saved.as_ref() {
            self.emit_status(saved);
            self.conversations.save_message(&owner, saved).await?;
        }
        self.conversations.save_meta(&owner, &meta_row).await?;

        if self.config.durable_outbox {
            self.outbox.enqueue(record).await?;
            self.arm_wake_at(now);
        } else {
            self.put_record(record.clone()).await?;
            self.start_direct(record).await?;
        }
        Ok(local_id)
    }

    pub async fn pump_outbox(&self) -> Result<usize, CoreError> {
        let ran = self.pump.run(|| self.drain_due()).await?;
        if ran.is_some() {
            self.arm_next_wake().await?;
        }
        Ok(ran.unwrap_or(0))
    }

    /// User-initiated retry of one send, keyed by local id. Starts a fresh
    /// attempt budget.
    pub async fn retry(&self, local_id: &str) -> Result<(), CoreError> {
        let record = match self.load_record(local_id).await? {
            Some(record) => record,
            None => return Err(CoreError::NotFound),
        };
        match record.status {
            OutboxStatus::Delivered | OutboxStatus::Delivering => Ok(()),
            _ => self.restart(record, true).await,
        }
    }

    /// Puts every failed echo whose send still has budget back in flight.
    /// The attempt count carries over, so a send that keeps failing ends in
    /// `failed_perm`.
    pub async fn retry_failed(&self) -> Result<usize, CoreError> {
        let failed: Vec<String> = {
            let state = self.state.lock().await;
            state
                .echoes
                .local_ids()
                .into_iter()
                .filter(|local_id| {
                    state
                        .echoes
                        .handle(local_id)
                        .and_then(|h| state.store.get(h))
                        .and_then(|m| m.echo.as_ref())
                        .map(|echo| echo.status == EchoStatus::Failed)
                        .unwrap_or(false)
                })
                .collect()
        };
        let mut retried = 0;
        for local_id in failed {
            let record = match self.load_record(&local_id).await? {
                Some(record) => record,
                None => continue,
            };
            if record.status.is_terminal()
                || record.status == OutboxStatus::Delivering
                || self.direct_retry_armed(&local_id).await
            {
                continue;
            }
            if record.attempt_count >= self.policy.max_attempts {
                self.exhaust(record).await?;
                continue;
            }
            self.restart(record, false).await?;
            retried += 1;
        }
        Ok(retried)
    }

    pub async fn receive_event(&self, event: SignedEvent) -> Result<Option<String>, CoreError> {
        validate_signed_event(&event).map_err(|err| CoreError::Validation(err.to_string()))?;
        if event.kind != self.config.event_kind {
            return Ok(None);
        }
        let owner = self.owner().await;
        if let Some(confirmed) = self.confirm_outgoing(&owner, &event.id).await? {
            return Ok(Some(confirmed));
        }
        let from_owner = event.pubkey == owner;
        let counterparty = if from_owner {
            match event.tag_values("p").into_iter().find(|p| *p != owner) {
                Some(peer) => peer.to_string(),
                None => return Ok(None),
            }
        } else {
            if !event.tag_values("p").contains(&owner.as_str()) {
                return Ok(None);
            }
            event.pubkey.clone()
        };
        let plaintext = match self.signer.decrypt(&counterparty, &event.content).await {
            Ok(plaintext) => plaintext,
            Err(err) => {
                log::debug!("parking undecryptable event {}: {}", event.id, err);
                let mut state = self.state.lock().await;
                if !state.pending_decrypts.iter().any(|e| e.id == event.id) {
                    state.pending_decrypts.push(event);
                }
                return Ok(None);
            }
        };
        let created_at_ms = event.created_at.saturating_mul(1000);
        let (message, created, meta_row) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            state.last_seen = state.last_seen.max(event.created_at);
            let (handle, hit) = state.store.merge(&event.id, || {
                let mut message =
                    Message::incoming(&event.id, &counterparty, &plaintext, created_at_ms);
                if from_owner {
                    message.direction = Direction::Outgoing;
                }
                message
            });
            let created = hit == MergeHit::Created;
            let active = state.store.active().map(|a| a.to_string());
            let meta_row = if created {
                let conversation = state.meta_mut(&counterparty);
                conversation.last_message_at = conversation.last_message_at.max(created_at_ms);
                if !from_owner && active.as_deref() != Some(counterparty.as_str()) {
                    conversation.unread += 1;
                }
                Some(conversation.clone())
            } else {
                None
            };
            (state.store.get(handle).cloned(), created, meta_row)
        };
        let message = match message {
            Some(message) => message,
            None => return Ok(None),
        };
        if created {
            self.events.publish(CourierEvent::MessageReceived {
                conversation: message.conversation.clone(),
                message_id: message.id.clone(),
            });
            for payload in message.payloads.iter() {
                self.events.publish(CourierEvent::PayloadReceived {
                    conversation: message.conversation.clone(),
                    message_id: message.id.clone(),
                    payload: payload.clone(),
                });
            }
            self.conversations.save_message(&owner, &message).await?;
        }
        if let Some(meta_row) = meta_row {
            self.conversations.save_meta(&owner, &meta_row).await?;
        }
        Ok(Some(message.id))
    }

    pub async fn retry_pending_decrypts(&self) -> Result<usize, CoreError> {
        let parked = std::mem::take(&mut self.state.lock().await.pending_decrypts);
        let mut merged = 0;
        for event in parked {
            if self.receive_event(event).await?.is_some() {
                merged += 1;
            }
        }
        Ok(merged)
    }

    pub async fn pending_decrypt_count(&self) -> usize {
        self.state.lock().await.pending_decrypts.len()
    }

    pub async fn start_inbox(&self) -> Result<usize, CoreError> {
        if self.config.transport_mode != TransportMode::Ws {
            return Ok(0);
        }
        let owner = self
            .signer
            .public_key()
            .ok_or(CoreError::SignerUnavailable)?;
        self.stop_inbox().await;
        let since = {
            let state = self.state.lock().await;
            if state.last_seen > 0 {
                Some(state.last_seen)
            } else {
                None
            }
        };
        let filters = vec![
            Filter::inbox(&owner, self.config.event_kind, since),
            Filter {
                authors: Some(vec![owner.clone()]),
                kinds: Some(vec![self.config.event_kind]),
                since,
                ..Filter::default()
            },
        ];
        let mut opened = Vec::new();
        for url in self.config.relays.iter() {
            let transport = self.pool.get(url).await;
            let mut subscription = transport.subscribe(filters.clone()).await;
            let sub_id = subscription.id.clone();
            let messenger = self.clone();
            let reader = tokio::spawn(async move {
                while let Some(message) = subscription.events.recv().await {
                    if let SubscriptionMessage::Event(event) = message {
                        if let Err(err) = messenger.receive_event(event).await {
                            log::debug!("inbound event rejected: {}", err);
                        }
                    }
                }
            });
            opened.push(InboxSubscription {
                transport,
                sub_id,
                reader: reader.abort_handle(),
            });
        }
        let count = opened.len();
        self.inbox.lock().await.extend(opened);
        Ok(count)
    }

    pub async fn stop_inbox(&self) {
        let subscriptions: Vec<InboxSubscription> = self.inbox.lock().await.drain(..).collect();
        for subscription in subscriptions {
            subscription.reader.abort();
            subscription
                .transport
                .unsubscribe(&subscription.sub_id)
                .await;
        }
    }

    pub async fn poll_once(&self) -> Result<usize, CoreError> {
        let fallback = match self.pool.fallback() {
            Some(fallback) => fallback,
            None => return Ok(0),
        };
        if self.config.transport_mode == TransportMode::Offline {
            return Ok(0);
        }
        let owner = self
            .signer
            .public_key()
            .ok_or(CoreError::SignerUnavailable)?;
        let since = {
            let state = self.state.lock().await;
            if state.last_seen > 0 {
                Some(state.last_seen)
            } else {
                None
            }
        };
        let events = fallback
            .query(&[Filter::inbox(&owner, self.config.event_kind, since)])
            .await?;
        let mut merged = 0;
        for event in events {
            match self.receive_event(event).await {
                Ok(Some(_)) => merged += 1,
                Ok(None) => {}
                Err(err) => log::debug!("polled event rejected: {}", err),
            }
        }
        Ok(merged)
    }

    /// Loads a conversation from the events table. Returns `false` when an
    /// owner switch happened during the load and the result was discarded.
    pub async fn load_conversation(&self, conversation: &str) -> Result<bool, CoreError> {
        let generation = self.generation.load(Ordering::SeqCst);
        let owner = self.owner().await;
        self.load_history(&owner, conversation, generation).await
    }

    async fn load_history(
        &self,
        owner: &str,
        conversation: &str,
        generation: u64,
    ) -> Result<bool, CoreError> {
        let messages = self
            .conversations
            .load_messages(owner, conversation)
            .await?;
        let meta = self.conversations.load_meta(owner, conversation).await?;
        let mut state = self.state.lock().await;
        if generation != self.generation.load(Ordering::SeqCst) || state.owner != owner {
            log::debug!("discarding stale load of {}", conversation);
            return Ok(false);
        }
        let state = &mut *state;
        for message in messages {
            let known = state.store.find(&message.id).is_some()
                || message
                    .local_id()
                    .and_then(|l| state.echoes.handle(l))
                    .is_some();
            if known {
                continue;
            }
            let local_id = message.local_id().map(|l| l.to_string());
            let pending = message
                .echo
                .as_ref()
                .map(|echo| echo.status != EchoStatus::Sent)
                .unwrap_or(false);
            let handle = state.store.insert(message);
            if let Some(local_id) = local_id {
                state.echoes.adopt(&local_id, handle);
                if pending {
                    state.store.index_local(&local_id, handle);
                }
            }
        }
        if let Some(meta) = meta {
            state.metas.insert(conversation.to_string(), meta);
        }
        Ok(true)
    }

    /// Switches the active identity. In-memory state is dropped and any load
    /// still in flight for the previous owner is discarded.
    pub async fn switch_owner(&self, owner: &str) -> Result<(), CoreError> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.stop_inbox().await;
        self.pump.cancel_wake();
        {
            let mut state = self.state.lock().await;
            state.echoes.cancel_all();
            *state = EngineState::new(owner);
        }
        {
            let mut direct = self.direct.lock().await;
            direct.cancel_all();
            direct.records.clear();
        }
        self.state.lock().await.settled.clear();
        self.restore_owner(owner).await
    }

    pub async fn set_active_conversation(
        &self,
        conversation: Option<&str>,
    ) -> Result<(), CoreError> {
        self.state.lock().await.store.set_active(conversation);
        if let Some(conversation) = conversation {
            self.mark_read(conversation).await?;
        }
        Ok(())
    }

    pub async fn mark_read(&self, conversation: &str) -> Result<(), CoreError> {
        let now = self.scheduler.now_ms();
        self.update_meta(conversation, |meta| {
            meta.unread = 0;
            meta.last_read_at = now;
        })
        .await
    }

    pub async fn set_pinned(&self, conversation: &str, pinned: bool) -> Result<(), CoreError> {
        self.update_meta(conversation, |meta| meta.pinned = pinned)
            .await
    }

    pub async fn set_alias(
        &self,
        conversation: &str,
        alias: Option<&str>,
    ) -> Result<(), CoreError> {
        let alias = alias
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty());
        self.update_meta(conversation, |meta| meta.alias = alias)
            .await
    }

    pub async fn delete_conversation(&self, conversation: &str) -> Result<usize, CoreError> {
        let owner = {
            let mut state = self.state.lock().await;
            let removed = state.store.remove_conversation(conversation);
            for message in removed.iter() {
                if let Some(local_id) = message.local_id() {
                    state.echoes.forget(local_id);
                }
            }
            state.metas.remove(conversation);
            state.owner.clone()
        };
        self.conversations
            .delete_conversation(&owner, conversation)
            .await
    }

    pub async fn conversation(&self, conversation: &str) -> Vec<Message> {
        let state = self.state.lock().await;
        state
            .store
            .messages(conversation)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn conversations(&self) -> Vec<ConversationMeta> {
        let state = self.state.lock().await;
        let mut metas: Vec<ConversationMeta> = state.metas.values().cloned().collect();
        metas.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then(b.last_message_at.cmp(&a.last_message_at))
        });
        metas
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        let state = self.state.lock().await;
        let handle = state.store.find(id).or_else(|| state.echoes.handle(id))?;
        state.store.get(handle).cloned()
    }

    pub async fn outbox_snapshot(&self) -> Result<Vec<OutboxRecord>, CoreError> {
        if self.config.durable_outbox {
            let owner = self.owner().await;
            self.outbox.all(&owner).await
        } else {
            let mut records: Vec<OutboxRecord> =
                self.direct.lock().await.records.values().cloned().collect();
            records.sort_by_key(|r| r.created_at);
            Ok(records)
        }
    }

    pub async fn relay_statuses(&self) -> BTreeMap<String, RelayStatus> {
        self.pool.statuses().await
    }

    pub async fn relay_health(&self) -> Result<Vec<RelayHealthRecord>, CoreError> {
        self.ranker.records().await
    }

    pub async fn shutdown(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            for worker in workers.drain(..) {
                worker.abort();
            }
        }
        self.stop_inbox().await;
        self.pump.cancel_wake();
        self.state.lock().await.echoes.cancel_all();
        self.direct.lock().await.cancel_all();
        self.pool.shutdown().await;
        log::info!("messenger shut down");
    }

    async fn restore_owner(&self, owner: &str) -> Result<(), CoreError> {
        if owner.is_empty() {
            return Ok(());
        }
        let now = self.scheduler.now_ms();
        let metas = self.conversations.load_metas(owner).await?;
        let last_seen = self.conversations.latest_incoming_at(owner).await?;
        {
            let mut state = self.state.lock().await;
            for meta in metas {
                state.metas.insert(meta.conversation.clone(), meta);
            }
            state.last_seen = last_seen.map(|ms| ms / 1000).unwrap_or(0);
        }
        if self.config.durable_outbox {
            let generation = self.generation.load(Ordering::SeqCst);
            self.outbox.recover_in_flight(owner, now).await?;
            // Open sends need their echoes tracked before the pump reports on them.
            let open: BTreeSet<String> = self
                .outbox
                .all(owner)
                .await?
                .into_iter()
                .filter(|record| !record.status.is_terminal())
                .map(|record| record.recipient)
                .collect();
            for conversation in open.iter() {
                self.load_history(owner, conversation, generation).await?;
            }
            self.arm_next_wake().await?;
        }
        Ok(())
    }

    async fn drain_due(&self) -> Result<usize, CoreError> {
        let owner = self.owner().await;
        if owner.is_empty() {
            return Ok(0);
        }
        let now = self.scheduler.now_ms();
        let due = self.outbox.due_items(&owner, now).await?;
        let mut processed = 0;
        for mut record in due {
            record.status = OutboxStatus::Delivering;
            record.updated_at = now;
            self.outbox.update(record.clone()).await?;
            let report = self.coordinator.deliver(record).await;
            self.apply_report(report).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn apply_report(&self, report: DeliveryReport) -> Result<(), CoreError> {
        let DeliveryReport {
            record,
            verdict,
            new_acks,
            error,
            rebuilt_event,
        } = report;
        if verdict == DeliveryVerdict::Unchanged {
            return Ok(());
        }
        if !self.store_report(&record).await? {
            log::debug!(
                "outbox record {} already settled, dropping attempt report",
                record.id
            );
            return Ok(());
        }
        let now = self.scheduler.now_ms();
        let local_id = record.id.as_str();
        let (transitions, saved, echo_pending) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let mut transitions: Vec<EchoTransition> = Vec::new();
            if let Some(event) = rebuilt_event.as_ref() {
                state
                    .echoes
                    .assign_event_id(&mut state.store, local_id, &event.id);
            }
            match &verdict {
                DeliveryVerdict::Delivered { confirmed } => {
                    transitions.extend(state.echoes.mark_sent(
                        &mut state.store,
                        local_id,
                        &new_acks,
                        AckSource::Relay,
                        now,
                    ));
                    if *confirmed {
                        transitions.extend(state.echoes.confirm(&mut state.store, local_id));
                    }
                }
                DeliveryVerdict::RetryScheduled { .. } => {
                    if let Some(message) = state
                        .echoes
                        .handle(local_id)
                        .and_then(|h| state.store.get_mut(h))
                    {
                        message::merge_acks(&mut message.relay_results, &new_acks);
                    }
                }
                DeliveryVerdict::FailedPerm => {
                    let reason = error
                        .as_ref()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "delivery failed".to_string());
                    transitions.extend(state.echoes.mark_failed(
                        &mut state.store,
                        local_id,
                        &reason,
                        &new_acks,
                        now,
                    ));
                }
                DeliveryVerdict::Unchanged => {}
            }
            let message = state
                .echoes
                .handle(local_id)
                .and_then(|h| state.store.get(h));
            let echo_pending = message
                .and_then(|m| m.echo.as_ref())
                .map(|echo| echo.status == EchoStatus::Pending)
                .unwrap_or(false);
            (transitions, message.cloned(), echo_pending)
        };
        for transition in transitions.iter() {
            self.publish_transition(transition);
        }
        match &verdict {
            DeliveryVerdict::Delivered { .. } => {
                self.cancel_direct_retry(local_id).await;
                self.settle(
                    local_id,
                    DeliveryOutcome::Delivered {
                        accepted: record.ack_count,
                    },
                )
                .await;
            }
            DeliveryVerdict::FailedPerm => {
                self.cancel_direct_retry(local_id).await;
                self.settle(
                    local_id,
                    DeliveryOutcome::Failed {
                        error: record.last_error.clone().unwrap_or_default(),
                    },
                )
                .await;
            }
            DeliveryVerdict::RetryScheduled { next_attempt_at } if !self.config.durable_outbox => {
                if echo_pending {
                    self.arm_direct_retry(local_id, *next_attempt_at).await;
                } else {
                    log::debug!("direct send {} parked until retried", local_id);
                }
            }
            _ => {}
        }
        if let Some(saved) = saved.as_ref() {
            self.conversations
                .save_message(&record.owner, saved)
                .await?;
        }
        Ok(())
    }

    /// Persists the record produced by an attempt. Returns `false` when the
    /// stored copy already reached a terminal state, in which case the report
    /// is stale. A late quorum on a record already marked delivered still
    /// contributes its acks.
    async fn store_report(&self, record: &OutboxRecord) -> Result<bool, CoreError> {
        let current = self.load_record(&record.id).await?;
        match current {
            Some(current) if current.status.is_terminal() => {
                if current.status == OutboxStatus::Delivered
                    && record.status == OutboxStatus::Delivered
                {
                    self.put_record(record.clone()).await?;
                }
                Ok(false)
            }
            _ => {
                self.put_record(record.clone()).await?;
                Ok(true)
            }
        }
    }

    async fn put_record(&self, record: OutboxRecord) -> Result<(), CoreError> {
        if self.config.durable_outbox {
            self.outbox.update(record).await
        } else {
            self.direct
                .lock()
                .await
                .records
                .insert(record.id.clone(), record);
            Ok(())
        }
    }

    async fn settle(&self, local_id: &str, outcome: DeliveryOutcome) {
        let first = self.state.lock().await.settled.insert(local_id.to_string());
        if !first {
            log::debug!(
                "send {} already settled, suppressing {:?}",
                local_id,
                outcome
            );
            return;
        }
        self.events.publish(CourierEvent::DeliverySettled {
            local_id: local_id.to_string(),
            outcome,
        });
    }

    /// Puts a record back in flight. A user retry starts a fresh attempt
    /// budget and a new settle series; otherwise the budget carries over.
    async fn restart(&self, mut record: OutboxRecord, fresh: bool) -> Result<(), CoreError> {
        let now = self.scheduler.now_ms();
        let local_id = record.id.clone();
        if fresh {
            record.attempt_count = 0;
            if record.ack_count == 0 {
                record.event = None;
            }
            self.state.lock().await.settled.remove(&local_id);
        }
        self.cancel_direct_retry(&local_id).await;
        record.status = OutboxStatus::Queued;
        record.next_attempt_at = now;
        record.last_error = None;
        record.updated_at = now;
        let (transition, saved) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let failed = state
                .echoes
                .handle(&local_id)
                .and_then(|h| state.store.get(h))
                .and_then(|m| m.echo.as_ref())
                .map(|echo| echo.status == EchoStatus::Failed)
                .unwrap_or(false);
            let timer = if failed && !self.config.durable_outbox {
                Some(self.arm_echo_timer(&local_id))
            } else {
                None
            };
            let transition = state.echoes.retry(&mut state.store, &local_id, timer, now);
            let saved = state
                .echoes
                .handle(&local_id)
                .and_then(|h| state.store.get(h).cloned());
            (transition, saved)
        };
        if let Some(transition) = transition.as_ref() {
            self.publish_transition(transition);
        }
        if let Some(saved) = saved.as_ref() {
            self.conversations
                .save_message(&record.owner, saved)
                .await?;
        }
        self.put_record(record.clone()).await?;
        if self.config.durable_outbox {
            self.arm_wake_at(now);
            Ok(())
        } else {
            self.start_direct(record).await
        }
    }

    async fn exhaust(&self, mut record: OutboxRecord) -> Result<(), CoreError> {
        let now = self.scheduler.now_ms();
        let local_id = record.id.clone();
        let reason = record
            .last_error
            .clone()
            .unwrap_or_else(|| "attempt budget exhausted".to_string());
        record.status = OutboxStatus::FailedPerm;
        record.last_error = Some(reason.clone());
        record.updated_at = now;
        self.cancel_direct_retry(&local_id).await;
        self.put_record(record.clone()).await?;
        log::warn!(
            "outbox record {} failed permanently after {} attempts: {}",
            local_id,
            record.attempt_count,
            reason
        );
        let transition = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            state
                .echoes
                .mark_failed(&mut state.store, &local_id, &reason, &BTreeMap::new(), now)
        };
        if let Some(transition) = transition.as_ref() {
            self.publish_transition(transition);
        }
        self.settle(&local_id, DeliveryOutcome::Failed { error: reason })
            .await;
        Ok(())
    }

    /// Evidence from outside the pump (an inbound copy or a recovery fetch)
    /// that the event reached a relay settles the record as delivered.
    async fn settle_by_evidence(&self, local_id: &str) -> Result<(), CoreError> {
        let mut record = match self.load_record(local_id).await? {
            Some(record) => record,
            None => return Ok(()),
        };
        if record.status == OutboxStatus::Delivered {
            return Ok(());
        }
        record.status = OutboxStatus::Delivered;
        record.last_error = None;
        record.updated_at = self.scheduler.now_ms();
        self.put_record(record.clone()).await?;
        self.cancel_direct_retry(local_id).await;
        log::info!(
            "outbox record {} delivered, event seen on a relay",
            local_id
        );
        self.settle(
            local_id,
            DeliveryOutcome::Delivered {
                accepted: record.ack_count,
            },
        )
        .await;
        Ok(())
    }

    async fn confirm_outgoing(
        &self,
        owner: &str,
        event_id: &str,
    ) -> Result<Option<String>, CoreError> {
        let now = self.scheduler.now_ms();
        let (transitions, saved, local_id) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let handle = match state.store.find(event_id) {
                Some(handle) => handle,
                None => return Ok(None),
            };
            let local_id = match state.store.get(handle) {
                Some(message) if message.direction == Direction::Outgoing => {
                    message.local_id().map(|l| l.to_string())
                }
                Some(message) => return Ok(Some(message.id.clone())),
                None => return Ok(None),
            };
            let mut transitions = Vec::new();
            if let Some(local_id) = local_id.as_ref() {
                let mut acks = BTreeMap::new();
                acks.insert("inbound".to_string(), RelayAck::accepted());
                transitions.extend(state.echoes.mark_sent(
                    &mut state.store,
                    local_id,
                    &acks,
                    AckSource::Inbound,
                    now,
                ));
                transitions.extend(state.echoes.confirm(&mut state.store, local_id));
            }
            (transitions, state.store.get(handle).cloned(), local_id)
        };
        for transition in transitions.iter() {
            self.publish_transition(transition);
        }
        if let Some(local_id) = local_id.as_ref() {
            self.settle_by_evidence(local_id).await?;
        }
        match saved {
            Some(saved) => {
                if transitions.iter().any(|t| t.changed) {
                    self.conversations.save_message(owner, &saved).await?;
                }
                Ok(Some(saved.id))
            }
            None => Ok(None),
        }
    }

    async fn on_echo_timeout(&self, local_id: &str) {
        let now = self.scheduler.now_ms();
        let outcome = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let relays = state
                .echoes
                .handle(local_id)
                .and_then(|h| state.store.get(h))
                .and_then(|m| m.echo.as_ref())
                .map(|echo| echo.relays.clone())
                .unwrap_or_default();
            state
                .echoes
                .handle_timeout(&mut state.store, local_id, now)
                .map(|(transition, event_id)| (transition, event_id, relays))
        };
        let (transition, event_id, relays) = match outcome {
            Some(outcome) => outcome,
            None => return,
        };
        self.publish_transition(&transition);
        log::warn!("local echo {} timed out, trying recovery fetch", local_id);
        let recovered = match event_id.as_ref() {
            Some(event_id) => {
                let timeout = Duration::from_millis(self.config.request_timeout_ms);
                match self.pool.fetch_event(event_id, &relays, timeout).await {
                    Ok(found) => found,
                    Err(err) => {
                        log::debug!("recovery fetch for {} failed: {}", event_id, err);
                        None
                    }
                }
            }
            None => None,
        };
        match recovered {
            Some(event) => self.absorb_recovered(local_id, &event).await,
            None => {
                // Parked until `retry_failed` or a user retry picks it up.
                self.cancel_direct_retry(local_id).await;
                self.settle(
                    local_id,
                    DeliveryOutcome::Failed {
                        error: "timeout".to_string(),
                    },
                )
                .await;
            }
        }
    }

    async fn absorb_recovered(&self, local_id: &str, event: &SignedEvent) {
        let now = self.scheduler.now_ms();
        let (transition, saved, owner) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            let conversation = state
                .echoes
                .handle(local_id)
                .and_then(|h| state.store.get(h))
                .map(|m| m.conversation.clone())
                .unwrap_or_default();
            let created_at_ms = event.created_at.saturating_mul(1000);
            let (handle, _) = state.store.merge(&event.id, || {
                Message::incoming(&event.id, &conversation, "", created_at_ms)
            });
            let transition = state.echoes.mark_sent(
                &mut state.store,
                local_id,
                &BTreeMap::new(),
                AckSource::Recovery,
                now,
            );
            (
                transition,
                state.store.get(handle).cloned(),
                state.owner.clone(),
            )
        };
        if let Some(transition) = transition.as_ref() {
            self.publish_transition(transition);
        }
        if let Some(saved) = saved.as_ref() {
            if let Err(err) = self.conversations.save_message(&owner, saved).await {
                log::warn!("failed to persist recovered message {}: {}", saved.id, err);
            }
        }
        if let Err(err) = self.settle_by_evidence(local_id).await {
            log::warn!("failed to settle recovered send {}: {}", local_id, err);
        }
    }

    async fn assign_event(&self, local_id: &str, event_id: &str) {
        let mut state = self.state.lock().await;
        let state = &mut *state;
        state
            .echoes
            .assign_event_id(&mut state.store, local_id, event_id);
    }

    async fn load_record(&self, local_id: &str) -> Result<Option<OutboxRecord>, CoreError> {
        if self.config.durable_outbox {
            self.outbox.get(local_id).await
        } else {
            Ok(self.direct.lock().await.records.get(local_id).cloned())
        }
    }

    async fn update_meta<F>(&self, conversation: &str, apply: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut ConversationMeta),
    {
        let (owner, meta) = {
            let mut state = self.state.lock().await;
            let meta = state.meta_mut(conversation);
            apply(meta);
            let meta = meta.clone();
            (state.owner.clone(), meta)
        };
        self.conversations.save_meta(&owner, &meta).await
    }

    /// Signs the event up front so the echo carries its id, then runs the
    /// attempt in the background. A signing failure counts as an attempt.
    async fn start_direct(&self, mut record: OutboxRecord) -> Result<(), CoreError> {
        let local_id = record.id.clone();
        match self.coordinator.prepare(&mut record).await {
            Ok(event) => {
                self.assign_event(&local_id, &event.id).await;
                record.status = OutboxStatus::Delivering;
                self.put_record(record.clone()).await?;
                self.spawn_direct(record);
                Ok(())
            }
            Err(err) => {
                record.attempt_count = record.attempt_count.saturating_add(1);
                let report = self
                    .coordinator
                    .settle_failure(record, BTreeMap::new(), err, None);
                self.apply_report(report).await
            }
        }
    }

    fn spawn_direct(&self, record: OutboxRecord) {
        let messenger = self.clone();
        tokio::spawn(async move {
            let report = messenger.coordinator.deliver(record).await;
            if let Err(err) = messenger.apply_report(report).await {
                log::warn!("direct send bookkeeping failed: {}", err);
            }
        });
    }

    async fn resume_direct(&self, local_id: &str) {
        let record = {
            let mut direct = self.direct.lock().await;
            direct.timers.remove(local_id);
            match direct.records.get_mut(local_id) {
                Some(record) if record.status == OutboxStatus::RetryScheduled => {
                    record.status = OutboxStatus::Delivering;
                    record.clone()
                }
                _ => return,
            }
        };
        let report = self.coordinator.deliver(record).await;
        if let Err(err) = self.apply_report(report).await {
            log::warn!("direct retry bookkeeping for {} failed: {}", local_id, err);
        }
    }

    fn arm_direct_retry<'a>(
        &'a self,
        local_id: &'a str,
        due_at: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let delay = due_at.saturating_sub(self.scheduler.now_ms());
            let messenger = self.clone();
            let id = local_id.to_string();
            let timer = self.scheduler.after(
                Duration::from_millis(delay),
                Box::pin(async move {
                    messenger.resume_direct(&id).await;
                }),
            );
            let previous = self
                .direct
                .lock()
                .await
                .timers
                .insert(local_id.to_string(), timer);
            if let Some(previous) = previous {
                previous.cancel();
            }
        })
    }

    async fn cancel_direct_retry(&self, local_id: &str) {
        if let Some(timer) = self.direct.lock().await.timers.remove(local_id) {
            timer.cancel();
        }
    }

    async fn direct_retry_armed(&self, local_id: &str) -> bool {
        self.direct.lock().await.timers.contains_key(local_id)
    }

    fn arm_echo_timer(&self, local_id: &str) -> TimerHandle {
        let messenger = self.clone();
        let local_id = local_id.to_string();
        self.scheduler.after(
            Duration::from_millis(self.config.echo_timeout_ms),
            Box::pin(async move {
                messenger.on_echo_timeout(&local_id).await;
            }),
        )
    }

    fn arm_wake_at(&self, due_at: u64) {
        let messenger = self.clone();
        self.pump.schedule_wake(
            self.scheduler.as_ref(),
            due_at,
            Box::pin(async move {
                messenger.pump.clear_wake();
                if let Err(err) = messenger.pump_outbox().await {
                    log::warn!("outbox pump failed: {}", err);
                }
            }),
        );
    }

    async fn arm_next_wake(&self) -> Result<(), CoreError> {
        let owner = self.owner().await;
        if owner.is_empty() {
            return Ok(());
        }
        if let Some(due_at) = self.outbox.next_wake(&owner).await? {
            self.arm_wake_at(due_at);
        }
        Ok(())
    }

    fn publish_transition(&self, transition: &EchoTransition) {
        if !transition.changed {
            return;
        }
        self.events.publish(CourierEvent::MessageStatus {
            conversation: transition.conversation.clone(),
            message_id: transition.message_id.clone(),
            local_id: Some(transition.local_id.clone()),
            status: transition.status,
        });
    }

    fn emit_status(&self, message: &Message) {
        self.events.publish(CourierEvent::MessageStatus {
            conversation: message.conversation.clone(),
            message_id: message.id.clone(),
            local_id: message.local_id().map(|l| l.to_string()),
            status: message.status,
        });
    }

    fn start_outbox_worker(&self) {
        let cloned = self.clone();
        let interval_ms = self.policy.pump_interval_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if let Err(err) = cloned.pump_outbox().await {
                    log::warn!("outbox pump failed: {}", err);
                }
                if let Err(err) = cloned.retry_failed().await {
                    log::warn!("retry of failed sends failed: {}", err);
                }
                if let Err(err) = cloned.retry_pending_decrypts().await {
                    log::warn!("retry of parked events failed: {}", err);
                }
            }
        });
        self.track_worker(handle.abort_handle());
    }

    fn start_poller(&self) {
        let cloned = self.clone();
        let interval_ms = self.config.poll_interval_ms;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                if let Err(err) = cloned.poll_once().await {
                    log::warn!("fallback poll failed: {}", err);
                }
            }
        });
        self.track_worker(handle.abort_handle());
    }

    fn track_worker(&self, handle: AbortHandle) {
        if let Ok(mut workers) = self.workers.lock() {
            workers.push(handle);
        }
    }
}

#[cfg(test)]
mod tests;
