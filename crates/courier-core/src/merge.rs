use crate::message::Message;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeHit {
    IdIndex,
    ActiveConversation,
    EventLog,
    LocalEcho,
    Created,
}

#[derive(Default)]
pub struct MessageStore {
    arena: Vec<Option<Message>>,
    by_id: HashMap<String, MessageHandle>,
    by_local: HashMap<String, MessageHandle>,
    conversations: HashMap<String, Vec<MessageHandle>>,
    event_log: Vec<MessageHandle>,
    active: Option<String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.arena.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: MessageHandle) -> Option<&Message> {
        self.arena.get(handle.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, handle: MessageHandle) -> Option<&mut Message> {
        self.arena.get_mut(handle.0).and_then(|slot| slot.as_mut())
    }

    pub fn find(&self, id: &str) -> Option<MessageHandle> {
        self.by_id
            .get(id)
            .copied()
            .filter(|h| self.get(*h).is_some())
    }

    pub fn find_by_local(&self, local_id: &str) -> Option<MessageHandle> {
        self.by_local
            .get(local_id)
            .copied()
            .filter(|h| self.get(*h).is_some())
    }

    pub fn set_active(&mut self, conversation: Option<&str>) {
        self.active = conversation.map(|c| c.to_string());
    }

    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn insert(&mut self, message: Message) -> MessageHandle {
        if let Some(existing) = self.find(&message.id) {
            if let Some(slot) = self.get_mut(existing) {
                *slot = message;
            }
            self.reindex(existing);
            return existing;
        }
        let handle = MessageHandle(self.arena.len());
        self.arena.push(Some(message));
        self.reindex(handle);
        handle
    }

    /// Resolves `event_id` to its canonical message, creating one with `build`
    /// when no lookup path knows it. Lookups run in order: id index, active
    /// conversation, event log, local echoes. The first hit wins.
    pub fn merge<F>(&mut self, event_id: &str, build: F) -> (MessageHandle, MergeHit)
    where
        F: FnOnce() -> Message,
    {
        if let Some((handle, hit)) = self.lookup(event_id) {
            if let Some(message) = self.get_mut(handle) {
                let echo_matches = message
                    .echo
                    .as_ref()
                    .map(|echo| echo.event_id.as_deref() == Some(event_id))
                    .unwrap_or(false);
                if echo_matches && message.id != event_id {
                    message.id = event_id.to_string();
                }
            }
            self.by_id.insert(event_id.to_string(), handle);
            self.reindex(handle);
            return (handle, hit);
        }
        let handle = self.insert(build());
        self.by_id.insert(event_id.to_string(), handle);
        (handle, MergeHit::Created)
    }

    fn lookup(&self, event_id: &str) -> Option<(MessageHandle, MergeHit)> {
        if let Some(handle) = self.find(event_id) {
            return Some((handle, MergeHit::IdIndex));
        }
        if let Some(active) = self.active.as_ref() {
            let hit = self
                .conversations
                .get(active)
                .and_then(|list| self.first_matching(list, event_id));
            if let Some(handle) = hit {
                return Some((handle, MergeHit::ActiveConversation));
            }
        }
        if let Some(handle) = self.first_matching(&self.event_log, event_id) {
            return Some((handle, MergeHit::EventLog));
        }
        self.by_local
            .values()
            .copied()
            .find(|handle| {
                self.get(*handle)
                    .and_then(|m| m.echo.as_ref())
                    .map(|echo| {
                        echo.event_id.as_deref() == Some(event_id) || echo.local_id == event_id
                    })
                    .unwrap_or(false)
            })
            .map(|handle| (handle, MergeHit::LocalEcho))
    }

    fn first_matching(&self, list: &[MessageHandle], event_id: &str) -> Option<MessageHandle> {
        list.iter().copied().find(|handle| {
            self.get(*handle)
                .map(|m| m.id == event_id || m.event_id() == Some(event_id))
                .unwrap_or(false)
        })
    }

    /// Points every id of the message at `handle` and (re)places it in its
    /// conversation list and the event log, one entry per id.
    pub fn reindex(&mut self, handle: MessageHandle) {
        let (id, conversation, local_id, echo_event) = match self.get(handle) {
            Some(m) => (
                m.id.clone(),
                m.conversation.clone(),
                m.local_id().map(|l| l.to_string()),
                m.echo.as_ref().and_then(|e| e.event_id.clone()),
            ),
            None => return,
        };
        self.by_id.insert(id.clone(), handle);
        if let Some(event_id) = echo_event {
            self.by_id.insert(event_id, handle);
        }
        if let Some(local_id) = local_id {
            let still_pending = self
                .get(handle)
                .and_then(|m| m.echo.as_ref())
                .map(|echo| echo.status != crate::message::EchoStatus::Sent)
                .unwrap_or(false);
            if still_pending {
                self.by_local.insert(local_id, handle);
            }
        }
        let mut list = self.conversations.remove(&conversation).unwrap_or_default();
        self.insert_unique(&mut list, handle, &id);
        self.conversations.insert(conversation, list);
        let mut log = std::mem::take(&mut self.event_log);
        self.insert_unique(&mut log, handle, &id);
        self.event_log = log;
    }

    fn insert_unique(&self, list: &mut Vec<MessageHandle>, handle: MessageHandle, id: &str) {
        list.retain(|h| *h != handle && self.get(*h).map(|m| m.id != id).unwrap_or(false));
        list.push(handle);
    }

    pub fn unindex_local(&mut self, local_id: &str) {
        self.by_local.remove(local_id);
    }

    pub fn index_local(&mut self, local_id: &str, handle: MessageHandle) {
        self.by_local.insert(local_id.to_string(), handle);
    }

    pub fn handles(&self, conversation: &str) -> Vec<MessageHandle> {
        self.conversations
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn messages(&self, conversation: &str) -> Vec<&Message> {
        let mut out: Vec<&Message> = self
            .conversations
            .get(conversation)
            .map(|list| list.iter().filter_map(|h| self.get(*h)).collect())
            .unwrap_or_default();
        out.sort_by_key(|m| m.created_at);
        out
    }

    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conversations
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn event_log_len(&self) -> usize {
        self.event_log.len()
    }

    pub fn remove_conversation(&mut self, conversation: &str) -> Vec<Message> {
        let handles = self.conversations.remove(conversation).unwrap_or_default();
        let mut removed = Vec::new();
        for handle in handles.iter() {
            if let Some(slot) = self.arena.get_mut(handle.0) {
                if let Some(message) = slot.take() {
                    removed.push(message);
                }
            }
        }
        self.by_id.retain(|_, h| !handles.contains(h));
        self.by_local.retain(|_, h| !handles.contains(h));
        self.event_log.retain(|h| !handles.contains(h));
        if self.active.as_deref() == Some(conversation) {
            self.active = None;
        }
        removed
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
