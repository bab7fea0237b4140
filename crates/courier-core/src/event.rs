use crate::message::MessageStatus;
use crate::transport::RelayStatus;
use courier_api::MessagePayload;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CourierEvent {
    MessageStatus {
        conversation: String,
        message_id: String,
        local_id: Option<String>,
        status: MessageStatus,
    },
    MessageReceived {
        conversation: String,
        message_id: String,
    },
    PayloadReceived {
        conversation: String,
        message_id: String,
        payload: MessagePayload,
    },
    /// Emitted once per terminal transition of a send.
    DeliverySettled {
        local_id: String,
        outcome: DeliveryOutcome,
    },
    RelayStatus {
        relay: String,
        status: RelayStatus,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { accepted: u32 },
    Failed { error: String },
}

pub type EventReceiver = broadcast::Receiver<CourierEvent>;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CourierEvent>,
}

impl EventBus {
    pub fn new(size: usize) -> Self {
        let (tx, _) = broadcast::channel(size);
        Self { tx }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CourierEvent) {
        let _ = self.tx.send(event);
    }
}
