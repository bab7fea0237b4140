use crate::error::CoreError;
use courier_api::{Filter, RelayAck, SignedEvent};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

#[async_trait::async_trait]
pub trait HttpFallback: Send + Sync {
    fn endpoint(&self) -> String;
    async fn query(&self, filters: &[Filter]) -> Result<Vec<SignedEvent>, CoreError>;
    async fn publish(&self, event: &SignedEvent) -> Result<RelayAck, CoreError>;
}

pub fn build_query_url(base: &str, filters: &[Filter]) -> Result<String, CoreError> {
    let serialized = serde_json::to_string(filters)?;
    let mut url = url::Url::parse(base).map_err(|err| CoreError::Validation(err.to_string()))?;
    url.query_pairs_mut().append_pair("filters", &serialized);
    Ok(url.to_string())
}

/// Non-JSON responses count as "no results". JSON that does not parse is an error.
pub fn parse_query_body(content_type: &str, body: &str) -> Result<Vec<SignedEvent>, CoreError> {
    let normalized = content_type.to_lowercase();
    let is_json =
        normalized.contains("application/json") || normalized.contains("application/nostr+json");
    if !is_json {
        log::warn!(
            "fallback query returned non-JSON payload ({})",
            if content_type.is_empty() {
                "unknown content-type"
            } else {
                content_type
            }
        );
        return Ok(Vec::new());
    }
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("events") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<SignedEvent>(item).ok())
        .collect())
}

/// Reads a publish response body: either `{accepted, message}` JSON or plain `OK`.
pub fn parse_publish_body(body: &str) -> Result<RelayAck, CoreError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(RelayAck::rejected("empty response body"));
    }
    if trimmed.eq_ignore_ascii_case("ok") {
        return Ok(RelayAck::accepted());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|_| CoreError::Transport("relay returned invalid JSON".to_string()))?;
    let accepted = value
        .get("accepted")
        .or_else(|| value.get("ok"))
        .map(|flag| flag.as_bool() == Some(true))
        .unwrap_or(false);
    let message = value
        .get("message")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());
    if accepted {
        Ok(RelayAck {
            accepted: true,
            reason: message,
        })
    } else {
        Ok(RelayAck::rejected(
            message.unwrap_or_else(|| "relay rejected event".to_string()),
        ))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryFallback {
    events: Arc<Mutex<Vec<SignedEvent>>>,
    publish_outcomes: Arc<Mutex<Vec<Result<RelayAck, CoreError>>>>,
    queries: Arc<Mutex<u32>>,
}

impl InMemoryFallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, event: SignedEvent) {
        self.events.lock().await.push(event);
    }

    /// Queues outcomes returned by upcoming publishes, in order. Once drained,
    /// publishes are accepted.
    pub async fn script_publish(&self, outcomes: Vec<Result<RelayAck, CoreError>>) {
        self.publish_outcomes.lock().await.extend(outcomes);
    }

    pub async fn stored(&self) -> Vec<SignedEvent> {
        self.events.lock().await.clone()
    }

    pub async fn query_count(&self) -> u32 {
        *self.queries.lock().await
    }
}

fn matches(filter: &Filter, event: &SignedEvent) -> bool {
    if let Some(ids) = filter.ids.as_ref() {
        if !ids.iter().any(|id| id == &event.id) {
            return false;
        }
    }
    if let Some(authors) = filter.authors.as_ref() {
        if !authors.iter().any(|a| a == &event.pubkey) {
            return false;
        }
    }
    if let Some(kinds) = filter.kinds.as_ref() {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if let Some(p_tags) = filter.p_tags.as_ref() {
        let tagged = event.tag_values("p");
        if !p_tags.iter().any(|p| tagged.contains(&p.as_str())) {
            return false;
        }
    }
    if let Some(since) = filter.since {
        if event.created_at < since {
            return false;
        }
    }
    if let Some(until) = filter.until {
        if event.created_at > until {
            return false;
        }
    }
    true
}

pub fn filter_matches(filters: &[Filter], event: &SignedEvent) -> bool {
    filters.iter().any(|filter| matches(filter, event))
}

#[async_trait::async_trait]
impl HttpFallback for InMemoryFallback {
    fn endpoint(&self) -> String {
        "memory://fallback".to_string()
    }

    async fn query(&self, filters: &[Filter]) -> Result<Vec<SignedEvent>, CoreError> {
        *self.queries.lock().await += 1;
        let guard = self.events.lock().await;
        Ok(guard
            .iter()
            .filter(|event| filter_matches(filters, event))
            .cloned()
            .collect())
    }

    async fn publish(&self, event: &SignedEvent) -> Result<RelayAck, CoreError> {
        let scripted = {
            let mut outcomes = self.publish_outcomes.lock().await;
            if outcomes.is_empty() {
                None
            } else {
                Some(outcomes.remove(0))
            }
        };
        let outcome = scripted.unwrap_or_else(|| Ok(RelayAck::accepted()));
        if let Ok(ack) = outcome.as_ref() {
            if ack.accepted {
                let mut guard = self.events.lock().await;
                if !guard.iter().any(|existing| existing.id == event.id) {
                    guard.push(event.clone());
                }
            }
        }
        outcome
    }
}
