use crate::error::CoreError;
use crate::message::Message;
use crate::store::{IndexKey, IndexPart, Record, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const INDEX_OWNER_CONVERSATION_CREATED: &str = "owner_conversation_created";
pub const INDEX_OWNER_META: &str = "owner_meta";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation: String,
    pub unread: u32,
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub last_message_at: u64,
    pub last_read_at: u64,
}

impl ConversationMeta {
    pub fn new(conversation: &str) -> Self {
        Self {
            conversation: conversation.to_string(),
            ..Self::default()
        }
    }
}

/// Row of the events table: either one message or one conversation's metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "row", rename_all = "snake_case")]
pub enum EventRow {
    Message {
        owner: String,
        message: Message,
    },
    Meta {
        owner: String,
        meta: ConversationMeta,
    },
}

impl EventRow {
    pub fn message_key(owner: &str, message: &Message) -> String {
        let stable = message.local_id().unwrap_or(message.id.as_str());
        format!("{}::msg::{}", owner, stable)
    }

    pub fn meta_key(owner: &str, conversation: &str) -> String {
        format!("{}::meta::{}", owner, conversation)
    }
}

impl Record for EventRow {
    fn key(&self) -> String {
        match self {
            EventRow::Message { owner, message } => EventRow::message_key(owner, message),
            EventRow::Meta { owner, meta } => EventRow::meta_key(owner, &meta.conversation),
        }
    }

    fn index_key(&self, index: &str) -> Option<IndexKey> {
        match (index, self) {
            (INDEX_OWNER_CONVERSATION_CREATED, EventRow::Message { owner, message }) => Some(vec![
                IndexPart::from(owner.as_str()),
                IndexPart::from(message.conversation.as_str()),
                IndexPart::Int(message.created_at),
            ]),
            (INDEX_OWNER_META, EventRow::Meta { owner, meta }) => Some(vec![
                IndexPart::from(owner.as_str()),
                IndexPart::from(meta.conversation.as_str()),
            ]),
            _ => None,
        }
    }
}

/// Persistence of messages and conversation metadata in the events table.
#[derive(Clone)]
pub struct ConversationStore {
    table: Arc<dyn Table<EventRow>>,
}

impl ConversationStore {
    pub fn new(table: Arc<dyn Table<EventRow>>) -> Self {
        Self { table }
    }

    pub async fn save_message(&self, owner: &str, message: &Message) -> Result<(), CoreError> {
        self.table
            .put(EventRow::Message {
                owner: owner.to_string(),
                message: message.clone(),
            })
            .await
    }

    /// Messages of one conversation, oldest first.
    pub async fn load_messages(
        &self,
        owner: &str,
        conversation: &str,
    ) -> Result<Vec<Message>, CoreError> {
        let rows = self
            .table
            .range(
                INDEX_OWNER_CONVERSATION_CREATED,
                vec![
                    IndexPart::from(owner),
                    IndexPart::from(conversation),
                    IndexPart::Int(0),
                ],
                vec![
                    IndexPart::from(owner),
                    IndexPart::from(conversation),
                    IndexPart::Int(u64::MAX),
                ],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                EventRow::Message { message, .. } => Some(message),
                EventRow::Meta { .. } => None,
            })
            .collect())
    }

    pub async fn save_meta(&self, owner: &str, meta: &ConversationMeta) -> Result<(), CoreError> {
        self.table
            .put(EventRow::Meta {
                owner: owner.to_string(),
                meta: meta.clone(),
            })
            .await
    }

    pub async fn load_meta(
        &self,
        owner: &str,
        conversation: &str,
    ) -> Result<Option<ConversationMeta>, CoreError> {
        match self
            .table
            .get(&EventRow::meta_key(owner, conversation))
            .await?
        {
            Some(EventRow::Meta { meta, .. }) => Ok(Some(meta)),
            _ => Ok(None),
        }
    }

    pub async fn load_metas(&self, owner: &str) -> Result<Vec<ConversationMeta>, CoreError> {
        let rows = self
            .table
            .range(
                INDEX_OWNER_META,
                vec![IndexPart::from(owner), IndexPart::from("")],
                vec![IndexPart::from(owner), IndexPart::from("\u{10ffff}")],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                EventRow::Meta { meta, .. } => Some(meta),
                EventRow::Message { .. } => None,
            })
            .collect())
    }

    /// Newest message timestamp across every stored conversation of `owner`, in ms.
    pub async fn latest_incoming_at(&self, owner: &str) -> Result<Option<u64>, CoreError> {
        let rows = self.table.scan().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row {
                EventRow::Message {
                    owner: row_owner,
                    message,
                } if row_owner == owner
                    && message.direction == crate::message::Direction::Incoming =>
                {
                    Some(message.created_at)
                }
                _ => None,
            })
            .max())
    }

    pub async fn delete_conversation(
        &self,
        owner: &str,
        conversation: &str,
    ) -> Result<usize, CoreError> {
        let messages = self.load_messages(owner, conversation).await?;
        let count = messages.len();
        for message in messages.iter() {
            self.table
                .delete(&EventRow::message_key(owner, message))
                .await?;
        }
        self.table
            .delete(&EventRow::meta_key(owner, conversation))
            .await?;
        Ok(count)
    }
}
