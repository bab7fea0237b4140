use courier_api::{Attachment, MessagePayload, RelayAck};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
    Confirmed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoStatus {
    Pending,
    Sent,
    Failed,
}

/// Everything needed to rebuild the outgoing event on retry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PayloadSnapshot {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<MessagePayload>,
}

impl PayloadSnapshot {
    pub fn new(content: &str) -> Self {
        Self {
            content: content.to_string(),
            attachment: courier_api::detect_attachment(content),
            payloads: courier_api::decode_payloads(content),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalEchoMeta {
    pub local_id: String,
    pub event_id: Option<String>,
    pub status: EchoStatus,
    pub created_at: u64,
    pub updated_at: u64,
    pub first_ack_at: Option<u64>,
    pub last_ack_at: Option<u64>,
    pub timer_started_at: Option<u64>,
    /// Milliseconds from timer start to the first ack, when both are known.
    pub latency_ms: Option<u64>,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub relays: Vec<String>,
    pub payload: PayloadSnapshot,
}

impl LocalEchoMeta {
    pub fn new(local_id: &str, payload: PayloadSnapshot, relays: Vec<String>, now: u64) -> Self {
        Self {
            local_id: local_id.to_string(),
            event_id: None,
            status: EchoStatus::Pending,
            created_at: now,
            updated_at: now,
            first_ack_at: None,
            last_ack_at: None,
            timer_started_at: None,
            latency_ms: None,
            attempt: 1,
            last_error: None,
            relays,
            payload,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation: String,
    pub content: String,
    pub created_at: u64,
    pub direction: Direction,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<MessagePayload>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relay_results: BTreeMap<String, RelayAck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub echo: Option<LocalEchoMeta>,
}

impl Message {
    pub fn outgoing(
        local_id: &str,
        conversation: &str,
        payload: PayloadSnapshot,
        now: u64,
    ) -> Self {
        Self {
            id: local_id.to_string(),
            conversation: conversation.to_string(),
            content: payload.content.clone(),
            created_at: now,
            direction: Direction::Outgoing,
            status: MessageStatus::Pending,
            attachment: payload.attachment.clone(),
            payloads: payload.payloads.clone(),
            relay_results: BTreeMap::new(),
            echo: None,
        }
    }

    pub fn incoming(event_id: &str, conversation: &str, plaintext: &str, created_at: u64) -> Self {
        Self {
            id: event_id.to_string(),
            conversation: conversation.to_string(),
            content: plaintext.to_string(),
            created_at,
            direction: Direction::Incoming,
            status: MessageStatus::Sent,
            attachment: courier_api::detect_attachment(plaintext),
            payloads: courier_api::decode_payloads(plaintext),
            relay_results: BTreeMap::new(),
            echo: None,
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.echo.as_ref().map(|echo| echo.local_id.as_str())
    }

    /// Event id from the echo, or the message id once it has been re-keyed.
    pub fn event_id(&self) -> Option<&str> {
        match self.echo.as_ref() {
            Some(echo) => echo.event_id.as_deref(),
            None => Some(self.id.as_str()),
        }
    }

    pub fn accepted_count(&self) -> u32 {
        self.relay_results
            .values()
            .filter(|ack| ack.accepted)
            .count() as u32
    }
}

/// Folds `updates` into `results` without ever downgrading an accepted entry.
pub fn merge_acks(results: &mut BTreeMap<String, RelayAck>, updates: &BTreeMap<String, RelayAck>) {
    for (relay, ack) in updates {
        match results.get(relay) {
            Some(existing) if existing.accepted => {}
            _ => {
                results.insert(relay.clone(), ack.clone());
            }
        }
    }
}
