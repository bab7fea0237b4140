use crate::config::{CoreConfig, TransportMode};
use crate::error::CoreError;
use crate::health::RelayHealthRanker;
use crate::outbox::{retry_delay, OutboxRecord, OutboxStatus};
use crate::policy::Policy;
use crate::pool::RelayPool;
use crate::scheduler::Scheduler;
use crate::signer::Signer;
use courier_api::{normalize_relay_url, RelayAck, SignedEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryVerdict {
    /// Quorum reached. `confirmed` tells whether the event was read back.
    Delivered {
        confirmed: bool,
    },
    RetryScheduled {
        next_attempt_at: u64,
    },
    FailedPerm,
    Unchanged,
}

#[derive(Clone, Debug)]
pub struct DeliveryReport {
    pub record: OutboxRecord,
    pub verdict: DeliveryVerdict,
    pub new_acks: BTreeMap<String, RelayAck>,
    pub error: Option<CoreError>,
    pub rebuilt_event: Option<SignedEvent>,
}

impl DeliveryReport {
    pub fn confirmation_pending(&self) -> bool {
        matches!(
            self.verdict,
            DeliveryVerdict::Delivered { confirmed: false }
        )
    }
}

pub fn effective_quorum(threshold: u32, targets: usize) -> u32 {
    threshold.min(targets as u32).max(1)
}

pub fn accepted_count(results: &BTreeMap<String, RelayAck>) -> u32 {
    results.values().filter(|ack| ack.accepted).count() as u32
}

#[derive(Clone)]
pub struct DeliveryCoordinator {
    config: CoreConfig,
    policy: Policy,
    signer: Arc<dyn Signer>,
    pool: RelayPool,
    ranker: RelayHealthRanker,
    scheduler: Arc<dyn Scheduler>,
}

impl DeliveryCoordinator {
    pub fn new(
        config: CoreConfig,
        policy: Policy,
        signer: Arc<dyn Signer>,
        pool: RelayPool,
        ranker: RelayHealthRanker,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            config,
            policy,
            signer,
            pool,
            ranker,
            scheduler,
        }
    }

    pub async fn deliver(&self, mut record: OutboxRecord) -> DeliveryReport {
        if record.status.is_terminal() {
            return DeliveryReport {
                record,
                verdict: DeliveryVerdict::Unchanged,
                new_acks: BTreeMap::new(),
                error: None,
                rebuilt_event: None,
            };
        }
        let now = self.scheduler.now_ms();
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.status = OutboxStatus::Delivering;
        record.updated_at = now;

        let (event, rebuilt) = match self.ensure_event(&mut record).await {
            Ok(built) => built,
            Err(err) => return self.settle_failure(record, BTreeMap::new(), err, None),
        };
        let rebuilt_event = if rebuilt { Some(event.clone()) } else { None };

        let ranked = match self.ranker.rank(&record.relays).await {
            Ok(ranked) => ranked,
            Err(err) => {
                log::warn!("relay ranking unavailable: {}", err);
                record
                    .relays
                    .iter()
                    .map(|u| normalize_relay_url(u))
                    .collect()
            }
        };
        let fallback = match self.config.transport_mode {
            TransportMode::Offline => None,
            _ => self.pool.fallback(),
        };
        let ws_targets = match self.config.transport_mode {
            TransportMode::Ws => ranked.len(),
            _ => 0,
        };
        let quorum = effective_quorum(
            self.config.quorum_threshold,
            ws_targets + usize::from(fallback.is_some()),
        );

        let mut new_acks = BTreeMap::new();
        let mut errors: Vec<CoreError> = Vec::new();

        if self.config.transport_mode == TransportMode::Ws {
            for url in ranked.iter() {
                if accepted_count(&record.relay_results) >= quorum {
                    break;
                }
                let already = record
                    .relay_results
                    .get(url)
                    .map(|ack| ack.accepted)
                    .unwrap_or(false);
                if already {
                    continue;
                }
                let ack = match self.publish_to_relay(url, &event).await {
                    Ok(ack) => {
                        if !ack.accepted {
                            let reason = ack.reason.clone().unwrap_or_default();
                            errors.push(CoreError::rejection(url, &reason));
                        }
                        ack
                    }
                    Err(err) => {
                        let ack = RelayAck::rejected(err.to_string());
                        errors.push(err);
                        ack
                    }
                };
                if let Err(err) = self.ranker.record_result(url, ack.accepted, now).await {
                    log::debug!("relay health update for {} failed: {}", url, err);
                }
                record_ack(&mut record, &mut new_acks, url, ack, now);
            }
        }

        if accepted_count(&record.relay_results) < quorum {
            if let Some(fallback) = fallback.as_ref() {
                let endpoint = fallback.endpoint();
                let already = record
                    .relay_results
                    .get(&endpoint)
                    .map(|ack| ack.accepted)
                    .unwrap_or(false);
                if !already {
                    let timeout = Duration::from_millis(self.config.http_ack_timeout_ms);
                    let ack = match tokio::time::timeout(timeout, fallback.publish(&event)).await {
                        Ok(Ok(ack)) => {
                            if !ack.accepted {
                                let reason = ack.reason.clone().unwrap_or_default();
                                errors.push(CoreError::rejection(&endpoint, &reason));
                            }
                            ack
                        }
                        Ok(Err(err)) => {
                            let ack = RelayAck::rejected(err.to_string());
                            errors.push(err);
                            ack
                        }
                        Err(_) => {
                            let err = CoreError::Timeout("fallback publish".to_string());
                            let ack = RelayAck::rejected(err.to_string());
                            errors.push(err);
                            ack
                        }
                    };
                    record_ack(&mut record, &mut new_acks, &endpoint, ack, now);
                }
            }
        }

        let accepted = accepted_count(&record.relay_results);
        record.ack_count = accepted;
        if accepted >= quorum {
            record.status = OutboxStatus::Delivered;
            record.last_error = None;
            let confirmed = self.confirm(&record, &event).await;
            log::info!(
                "delivered {} ({} of {} required acks)",
                record.id,
                accepted,
                quorum
            );
            return DeliveryReport {
                record,
                verdict: DeliveryVerdict::Delivered { confirmed },
                new_acks,
                error: None,
                rebuilt_event,
            };
        }

        let error = if let Some(permanent) = errors.iter().find(|e| !e.is_retryable()) {
            permanent.clone()
        } else if accepted > 0 {
            CoreError::QuorumNotReached {
                accepted,
                required: quorum,
            }
        } else {
            errors
                .pop()
                .unwrap_or_else(|| CoreError::Transport("no relay targets available".to_string()))
        };
        self.settle_failure(record, new_acks, error, rebuilt_event)
    }

    /// Signs the record's event ahead of the first attempt so its id is known
    /// before any relay is contacted.
    pub async fn prepare(&self, record: &mut OutboxRecord) -> Result<SignedEvent, CoreError> {
        self.ensure_event(record).await.map(|(event, _)| event)
    }

    async fn ensure_event(
        &self,
        record: &mut OutboxRecord,
    ) -> Result<(SignedEvent, bool), CoreError> {
        if let Some(event) = record.event.as_ref() {
            if event.is_well_formed() {
                return Ok((event.clone(), false));
            }
        }
        let event = self
            .signer
            .build_event(
                &record.recipient,
                &record.payload.content,
                self.config.event_kind,
            )
            .await
            .map_err(|err| match err {
                CoreError::SignerUnavailable | CoreError::Encryption(_) => err,
                other => CoreError::Encryption(other.to_string()),
            })?;
        if !event.is_well_formed() {
            return Err(CoreError::Encryption(
                "signer produced a malformed event".to_string(),
            ));
        }
        record.message_id = event.id.clone();
        record.event = Some(event.clone());
        Ok((event, true))
    }

    async fn publish_to_relay(
        &self,
        url: &str,
        event: &SignedEvent,
    ) -> Result<RelayAck, CoreError> {
        let timeout = Duration::from_millis(self.config.ws_ack_timeout_ms);
        let transport = self.pool.get(url).await;
        transport.retain().await;
        let result = match transport
            .authenticate(
                self.signer.as_ref(),
                self.config.require_auth,
                self.config.auth_cache_ms,
                timeout,
            )
            .await
        {
            Ok(()) => transport.publish(event, timeout).await,
            Err(err) => Err(err),
        };
        transport.release().await;
        result
    }

    async fn confirm(&self, record: &OutboxRecord, event: &SignedEvent) -> bool {
        if self.config.transport_mode == TransportMode::Offline {
            return false;
        }
        let endpoint = self.pool.fallback().map(|f| f.endpoint());
        let relays: Vec<String> = record
            .accepted_relays()
            .into_iter()
            .filter(|relay| Some(relay) != endpoint.as_ref())
            .filter(|_| self.config.transport_mode == TransportMode::Ws)
            .collect();
        let timeout = Duration::from_millis(self.policy.confirm_timeout_ms);
        match self.pool.fetch_event(&event.id, &relays, timeout).await {
            Ok(found) => found.is_some(),
            Err(err) => {
                log::debug!("confirmation fetch for {} failed: {}", event.id, err);
                false
            }
        }
    }

    /// Turns a failed attempt into a reschedule or a permanent failure,
    /// depending on the error and the remaining attempt budget.
    pub fn settle_failure(
        &self,
        mut record: OutboxRecord,
        new_acks: BTreeMap<String, RelayAck>,
        error: CoreError,
        rebuilt_event: Option<SignedEvent>,
    ) -> DeliveryReport {
        let now = self.scheduler.now_ms();
        record.last_error = Some(error.to_string());
        record.updated_at = now;
        let exhausted = record.attempt_count >= self.policy.max_attempts;
        let verdict = if !error.is_retryable() || exhausted {
            record.status = OutboxStatus::FailedPerm;
            log::warn!(
                "outbox record {} failed permanently after {} attempts: {}",
                record.id,
                record.attempt_count,
                error
            );
            DeliveryVerdict::FailedPerm
        } else {
            let delay = retry_delay(record.attempt_count, &self.policy, &mut rand::thread_rng());
            record.status = OutboxStatus::RetryScheduled;
            record.next_attempt_at = now.saturating_add(delay);
            log::warn!(
                "outbox record {} attempt {} failed, retry in {}ms: {}",
                record.id,
                record.attempt_count,
                delay,
                error
            );
            DeliveryVerdict::RetryScheduled {
                next_attempt_at: record.next_attempt_at,
            }
        };
        DeliveryReport {
            record,
            verdict,
            new_acks,
            error: Some(error),
            rebuilt_event,
        }
    }
}

fn record_ack(
    record: &mut OutboxRecord,
    new_acks: &mut BTreeMap<String, RelayAck>,
    relay: &str,
    ack: RelayAck,
    now: u64,
) {
    if ack.accepted {
        if record.first_ack_at.is_none() {
            record.first_ack_at = Some(now);
        }
        record.last_ack_at = Some(now);
    }
    let keep_existing = record
        .relay_results
        .get(relay)
        .map(|existing| existing.accepted)
        .unwrap_or(false);
    if !keep_existing {
        record.relay_results.insert(relay.to_string(), ack.clone());
    }
    new_acks.insert(relay.to_string(), ack);
}
