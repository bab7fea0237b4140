use crate::error::CoreError;
use crate::message::PayloadSnapshot;
use crate::policy::Policy;
use crate::scheduler::{Scheduler, Task, TimerHandle};
use crate::store::{IndexKey, IndexPart, Record, Table};
use courier_api::{RelayAck, SignedEvent};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INDEX_OWNER_STATUS: &str = "owner_status";
pub const INDEX_OWNER_NEXT_ATTEMPT: &str = "owner_next_attempt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Queued,
    Delivering,
    RetryScheduled,
    Delivered,
    FailedPerm,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Queued => "queued",
            OutboxStatus::Delivering => "delivering",
            OutboxStatus::RetryScheduled => "retry_scheduled",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::FailedPerm => "failed_perm",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Delivered | OutboxStatus::FailedPerm)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: String,
    pub owner: String,
    pub message_id: String,
    pub recipient: String,
    pub status: OutboxStatus,
    pub next_attempt_at: u64,
    pub attempt_count: u32,
    pub payload: PayloadSnapshot,
    pub relays: Vec<String>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub relay_results: BTreeMap<String, RelayAck>,
    pub ack_count: u32,
    pub first_ack_at: Option<u64>,
    pub last_ack_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
    /// Signed event of the current attempt series. Retries reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<SignedEvent>,
}

impl OutboxRecord {
    pub fn new(
        local_id: &str,
        owner: &str,
        recipient: &str,
        payload: PayloadSnapshot,
        relays: Vec<String>,
        now: u64,
    ) -> Self {
        Self {
            id: local_id.to_string(),
            owner: owner.to_string(),
            message_id: local_id.to_string(),
            recipient: recipient.to_string(),
            status: OutboxStatus::Queued,
            next_attempt_at: now,
            attempt_count: 0,
            payload,
            relays,
            last_error: None,
            relay_results: BTreeMap::new(),
            ack_count: 0,
            first_ack_at: None,
            last_ack_at: None,
            created_at: now,
            updated_at: now,
            event: None,
        }
    }

    pub fn is_due(&self, now: u64) -> bool {
        matches!(
            self.status,
            OutboxStatus::Queued | OutboxStatus::RetryScheduled
        ) && self.next_attempt_at <= now
    }

    pub fn accepted_relays(&self) -> Vec<String> {
        self.relay_results
            .iter()
            .filter(|(_, ack)| ack.accepted)
            .map(|(relay, _)| relay.clone())
            .collect()
    }
}

impl Record for OutboxRecord {
    fn key(&self) -> String {
        self.id.clone()
    }

    fn index_key(&self, index: &str) -> Option<IndexKey> {
        match index {
            INDEX_OWNER_STATUS => Some(vec![
                IndexPart::from(self.owner.as_str()),
                IndexPart::from(self.status.as_str()),
            ]),
            INDEX_OWNER_NEXT_ATTEMPT => Some(vec![
                IndexPart::from(self.owner.as_str()),
                IndexPart::Int(self.next_attempt_at),
            ]),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct OutboxQueue {
    table: Arc<dyn Table<OutboxRecord>>,
}

impl OutboxQueue {
    pub fn new(table: Arc<dyn Table<OutboxRecord>>) -> Self {
        Self { table }
    }

    pub async fn enqueue(&self, record: OutboxRecord) -> Result<(), CoreError> {
        self.table.put(record).await
    }

    pub async fn update(&self, record: OutboxRecord) -> Result<(), CoreError> {
        self.table.put(record).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<OutboxRecord>, CoreError> {
        self.table.get(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        self.table.delete(id).await
    }

    pub async fn due_items(&self, owner: &str, now: u64) -> Result<Vec<OutboxRecord>, CoreError> {
        let rows = self
            .table
            .range(
                INDEX_OWNER_NEXT_ATTEMPT,
                vec![IndexPart::from(owner), IndexPart::Int(0)],
                vec![IndexPart::from(owner), IndexPart::Int(now)],
            )
            .await?;
        Ok(rows.into_iter().filter(|r| r.is_due(now)).collect())
    }

    pub async fn by_status(
        &self,
        owner: &str,
        status: OutboxStatus,
    ) -> Result<Vec<OutboxRecord>, CoreError> {
        let key = vec![IndexPart::from(owner), IndexPart::from(status.as_str())];
        self.table.range(INDEX_OWNER_STATUS, key.clone(), key).await
    }

    pub async fn all(&self, owner: &str) -> Result<Vec<OutboxRecord>, CoreError> {
        let mut rows: Vec<OutboxRecord> = self
            .table
            .scan()
            .await?
            .into_iter()
            .filter(|r| r.owner == owner)
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    pub async fn next_wake(&self, owner: &str) -> Result<Option<u64>, CoreError> {
        let mut earliest: Option<u64> = None;
        for status in [OutboxStatus::Queued, OutboxStatus::RetryScheduled] {
            for record in self.by_status(owner, status).await? {
                earliest = Some(match earliest {
                    Some(current) => current.min(record.next_attempt_at),
                    None => record.next_attempt_at,
                });
            }
        }
        Ok(earliest)
    }

    /// Puts records left in `delivering` by a crash back in the queue.
    pub async fn recover_in_flight(&self, owner: &str, now: u64) -> Result<usize, CoreError> {
        let stuck = self.by_status(owner, OutboxStatus::Delivering).await?;
        let count = stuck.len();
        for mut record in stuck {
            record.status = OutboxStatus::Queued;
            record.next_attempt_at = record.next_attempt_at.min(now);
            record.updated_at = now;
            self.table.put(record).await?;
        }
        if count > 0 {
            log::info!("recovered {} in-flight outbox records for {}", count, owner);
        }
        Ok(count)
    }
}

fn bound(value: u64, base: u64, max: u64) -> u64 {
    value.max(base).min(max.max(base))
}

/// `clamp(base * 2^(attempt-1), base, max)` without jitter. `attempt` is 1-based.
pub fn backoff_delay(attempt: u32, policy: &Policy) -> u64 {
    let attempt = attempt.clamp(1, policy.max_attempts.max(1));
    let exponent = (attempt - 1).min(32);
    let raw = policy.backoff_base_ms.saturating_mul(1u64 << exponent);
    bound(raw, policy.backoff_base_ms, policy.backoff_max_ms)
}

/// Backoff with multiplicative jitter, kept within `[base, max]`.
pub fn retry_delay<R: Rng + ?Sized>(attempt: u32, policy: &Policy, rng: &mut R) -> u64 {
    let delay = backoff_delay(attempt, policy) as f64;
    let ratio = policy.jitter_ratio.clamp(0.0, 1.0);
    let factor = if ratio > 0.0 {
        rng.gen_range((1.0 - ratio)..=(1.0 + ratio))
    } else {
        1.0
    };
    bound(
        (delay * factor).round() as u64,
        policy.backoff_base_ms,
        policy.backoff_max_ms,
    )
}

#[derive(Default)]
struct PumpFlags {
    running: bool,
    rerun: bool,
}

#[derive(Default)]
struct Wake {
    due_at: u64,
    timer: Option<TimerHandle>,
}

/// Single-flight guard around outbox draining plus the timer for the next due record.
#[derive(Clone, Default)]
pub struct OutboxPump {
    flags: Arc<Mutex<PumpFlags>>,
    wake: Arc<Mutex<Wake>>,
}

struct RunGuard<'a> {
    pump: &'a OutboxPump,
    finished: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Ok(mut flags) = self.pump.flags.lock() {
                flags.running = false;
                flags.rerun = false;
            }
        }
    }
}

impl OutboxPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.flags.lock().map(|f| f.running).unwrap_or(false)
    }

    fn begin(&self) -> bool {
        match self.flags.lock() {
            Ok(mut flags) => {
                if flags.running {
                    flags.rerun = true;
                    false
                } else {
                    flags.running = true;
                    flags.rerun = false;
                    true
                }
            }
            Err(_) => false,
        }
    }

    fn finish(&self) -> bool {
        match self.flags.lock() {
            Ok(mut flags) => {
                if flags.rerun {
                    flags.rerun = false;
                    true
                } else {
                    flags.running = false;
                    false
                }
            }
            Err(_) => false,
        }
    }

    /// Runs `drain` until no further run has been requested. A call made while
    /// a run is active only flags that run and returns `Ok(None)`.
    pub async fn run<F, Fut>(&self, mut drain: F) -> Result<Option<usize>, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<usize, CoreError>>,
    {
        if !self.begin() {
            return Ok(None);
        }
        let mut guard = RunGuard {
            pump: self,
            finished: false,
        };
        let mut processed = 0;
        loop {
            processed += drain().await?;
            if !self.finish() {
                break;
            }
        }
        guard.finished = true;
        Ok(Some(processed))
    }

    /// Arms one wake-up at `due_at`, replacing a later one. An earlier or equal
    /// wake already armed is kept.
    pub fn schedule_wake(&self, scheduler: &dyn Scheduler, due_at: u64, task: Task) {
        let mut wake = match self.wake.lock() {
            Ok(wake) => wake,
            Err(_) => return,
        };
        let now = scheduler.now_ms();
        if let Some(timer) = wake.timer.as_ref() {
            if !timer.is_cancelled() && wake.due_at <= due_at && wake.due_at >= now {
                return;
            }
            timer.cancel();
        }
        let delay = due_at.saturating_sub(now);
        wake.due_at = due_at;
        wake.timer = Some(scheduler.after(Duration::from_millis(delay), task));
    }

    pub fn clear_wake(&self) {
        if let Ok(mut wake) = self.wake.lock() {
            wake.timer = None;
        }
    }

    pub fn cancel_wake(&self) {
        if let Ok(mut wake) = self.wake.lock() {
            if let Some(timer) = wake.timer.take() {
                timer.cancel();
            }
        }
    }
}
