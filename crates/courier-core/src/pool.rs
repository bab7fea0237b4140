use crate::error::CoreError;
use crate::event::EventBus;
use crate::fallback::HttpFallback;
use crate::policy::Policy;
use crate::scheduler::Scheduler;
use crate::transport::{RelayStatus, RelayTransport, SocketConnector};
use courier_api::{normalize_relay_url, Filter, SignedEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Shared set of relay transports, one per normalized URL.
#[derive(Clone)]
pub struct RelayPool {
    connector: Arc<dyn SocketConnector>,
    scheduler: Arc<dyn Scheduler>,
    fallback: Option<Arc<dyn HttpFallback>>,
    policy: Policy,
    events: EventBus,
    transports: Arc<Mutex<BTreeMap<String, RelayTransport>>>,
}

impl RelayPool {
    pub fn new(
        connector: Arc<dyn SocketConnector>,
        scheduler: Arc<dyn Scheduler>,
        fallback: Option<Arc<dyn HttpFallback>>,
        policy: Policy,
        events: EventBus,
    ) -> Self {
        Self {
            connector,
            scheduler,
            fallback,
            policy,
            events,
            transports: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn fallback(&self) -> Option<Arc<dyn HttpFallback>> {
        self.fallback.clone()
    }

    pub async fn get(&self, url: &str) -> RelayTransport {
        let key = normalize_relay_url(url);
        let mut guard = self.transports.lock().await;
        guard
            .entry(key.clone())
            .or_insert_with(|| {
                RelayTransport::new(
                    &key,
                    self.connector.clone(),
                    self.scheduler.clone(),
                    &self.policy,
                    self.events.clone(),
                )
            })
            .clone()
    }

    /// Best-effort lookup of one event across `relays`, then the fallback.
    pub async fn fetch_event(
        &self,
        event_id: &str,
        relays: &[String],
        timeout: Duration,
    ) -> Result<Option<SignedEvent>, CoreError> {
        let filters = vec![Filter::by_id(event_id)];
        let mut last_err = None;
        let mut answered = false;
        for url in relays {
            let transport = self.get(url).await;
            match transport.request_once(filters.clone(), timeout, None).await {
                Ok(events) => {
                    answered = true;
                    if let Some(found) = events.into_iter().find(|e| e.id == event_id) {
                        return Ok(Some(found));
                    }
                }
                Err(err) => {
                    log::debug!("fetch of {} from {} failed: {}", event_id, url, err);
                    last_err = Some(err);
                }
            }
        }
        if let Some(fallback) = self.fallback.as_ref() {
            match fallback.query(&filters).await {
                Ok(events) => {
                    answered = true;
                    if let Some(found) = events.into_iter().find(|e| e.id == event_id) {
                        return Ok(Some(found));
                    }
                }
                Err(err) => last_err = Some(err),
            }
        }
        match last_err {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
    }

    pub async fn statuses(&self) -> BTreeMap<String, RelayStatus> {
        let guard = self.transports.lock().await;
        guard
            .iter()
            .map(|(url, transport)| (url.clone(), transport.status()))
            .collect()
    }

    pub async fn shutdown(&self) {
        let transports: Vec<RelayTransport> = {
            let mut guard = self.transports.lock().await;
            let all = guard.values().cloned().collect();
            guard.clear();
            all
        };
        for transport in transports {
            transport.shutdown().await;
        }
    }
}
