use crate::merge::{MessageHandle, MessageStore};
use crate::message::{merge_acks, EchoStatus, LocalEchoMeta, Message, MessageStatus};
use crate::scheduler::TimerHandle;
use courier_api::RelayAck;
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckSource {
    Relay,
    Fallback,
    Recovery,
    Inbound,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoTransition {
    pub handle: MessageHandle,
    pub conversation: String,
    pub message_id: String,
    pub local_id: String,
    pub status: MessageStatus,
    pub changed: bool,
}

#[derive(Default)]
pub struct LocalEchoTracker {
    handles: HashMap<String, MessageHandle>,
    timers: HashMap<String, TimerHandle>,
}

impl LocalEchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, local_id: &str) -> Option<MessageHandle> {
        self.handles.get(local_id).copied()
    }

    pub fn local_ids(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn has_timer(&self, local_id: &str) -> bool {
        self.timers.contains_key(local_id)
    }

    /// Registers the echo. `timer` is only supplied in direct-send mode, where
    /// no durable outbox will drive the message to a terminal state.
    pub fn schedule(
        &mut self,
        store: &mut MessageStore,
        mut message: Message,
        mut meta: LocalEchoMeta,
        timer: Option<TimerHandle>,
        now: u64,
    ) -> MessageHandle {
        let local_id = meta.local_id.clone();
        if timer.is_some() {
            meta.timer_started_at = Some(now);
        }
        message.echo = Some(meta);
        let handle = store.insert(message);
        store.index_local(&local_id, handle);
        self.handles.insert(local_id.clone(), handle);
        if let Some(timer) = timer {
            self.replace_timer(&local_id, Some(timer));
        }
        handle
    }

    pub fn adopt(&mut self, local_id: &str, handle: MessageHandle) {
        self.handles.insert(local_id.to_string(), handle);
    }

    pub fn assign_event_id(&mut self, store: &mut MessageStore, local_id: &str, event_id: &str) {
        let handle = match self.handles.get(local_id) {
            Some(handle) => *handle,
            None => return,
        };
        if let Some(message) = store.get_mut(handle) {
            if let Some(echo) = message.echo.as_mut() {
                echo.event_id = Some(event_id.to_string());
            }
            message.id = event_id.to_string();
        }
        store.reindex(handle);
    }

    /// Idempotent. A message already `sent` only folds in the new acks. A
    /// `failed` echo is upgraded since acks are evidence of delivery.
    pub fn mark_sent(
        &mut self,
        store: &mut MessageStore,
        local_id: &str,
        acks: &BTreeMap<String, RelayAck>,
        source: AckSource,
        now: u64,
    ) -> Option<EchoTransition> {
        let handle = *self.handles.get(local_id)?;
        let message = store.get_mut(handle)?;
        merge_acks(&mut message.relay_results, acks);
        let echo = message.echo.as_mut()?;
        let changed = echo.status != EchoStatus::Sent;
        if changed {
            echo.status = EchoStatus::Sent;
            echo.updated_at = now;
            echo.last_error = None;
            if let Some(started) = echo.timer_started_at {
                echo.latency_ms = Some(now.saturating_sub(started));
            }
            if message.status != MessageStatus::Confirmed {
                message.status = MessageStatus::Sent;
            }
            log::debug!("echo {} sent via {:?}", local_id, source);
        }
        if !acks.is_empty() || changed {
            echo.last_ack_at = Some(now);
            if echo.first_ack_at.is_none() {
                echo.first_ack_at = Some(now);
            }
        }
        let transition = transition(handle, message, local_id, changed);
        self.replace_timer(local_id, None);
        store.unindex_local(local_id);
        Some(transition)
    }

    /// Idempotent terminal transition out of `pending`. Accumulated acks are kept.
    pub fn mark_failed(
        &mut self,
        store: &mut MessageStore,
        local_id: &str,
        reason: &str,
        acks: &BTreeMap<String, RelayAck>,
        now: u64,
    ) -> Option<EchoTransition> {
        let handle = *self.handles.get(local_id)?;
        let message = store.get_mut(handle)?;
        merge_acks(&mut message.relay_results, acks);
        let echo = message.echo.as_mut()?;
        let changed = echo.status == EchoStatus::Pending;
        if changed {
            echo.status = EchoStatus::Failed;
            echo.updated_at = now;
            echo.last_error = Some(reason.to_string());
            message.status = MessageStatus::Failed;
        }
        let transition = transition(handle, message, local_id, changed);
        self.replace_timer(local_id, None);
        Some(transition)
    }

    /// Fires the local-echo timeout. Returns the event id to attempt a recovery
    /// fetch with, or `None` when the echo already left `pending`.
    pub fn handle_timeout(
        &mut self,
        store: &mut MessageStore,
        local_id: &str,
        now: u64,
    ) -> Option<(EchoTransition, Option<String>)> {
        let handle = *self.handles.get(local_id)?;
        let event_id = {
            let echo = store.get(handle)?.echo.as_ref()?;
            if echo.status != EchoStatus::Pending {
                return None;
            }
            echo.event_id.clone()
        };
        self.timers.remove(local_id);
        let transition = self.mark_failed(store, local_id, "timeout", &BTreeMap::new(), now)?;
        Some((transition, event_id))
    }

    pub fn retry(
        &mut self,
        store: &mut MessageStore,
        local_id: &str,
        timer: Option<TimerHandle>,
        now: u64,
    ) -> Option<EchoTransition> {
        let handle = *self.handles.get(local_id)?;
        let message = store.get_mut(handle)?;
        let echo = message.echo.as_mut()?;
        if echo.status != EchoStatus::Failed {
            return None;
        }
        echo.status = EchoStatus::Pending;
        echo.attempt += 1;
        echo.updated_at = now;
        echo.last_error = None;
        echo.timer_started_at = timer.as_ref().map(|_| now);
        message.status = MessageStatus::Pending;
        let transition = transition(handle, message, local_id, true);
        store.index_local(local_id, handle);
        self.replace_timer(local_id, timer);
        Some(transition)
    }

    pub fn confirm(&mut self, store: &mut MessageStore, local_id: &str) -> Option<EchoTransition> {
        let handle = *self.handles.get(local_id)?;
        let message = store.get_mut(handle)?;
        let sent = message
            .echo
            .as_ref()
            .map(|echo| echo.status == EchoStatus::Sent)
            .unwrap_or(false);
        let changed = sent && message.status == MessageStatus::Sent;
        if changed {
            message.status = MessageStatus::Confirmed;
        }
        Some(transition(handle, message, local_id, changed))
    }

    pub fn forget(&mut self, local_id: &str) {
        self.replace_timer(local_id, None);
        self.handles.remove(local_id);
    }

    pub fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.cancel();
        }
    }

    fn replace_timer(&mut self, local_id: &str, timer: Option<TimerHandle>) {
        if let Some(previous) = self.timers.remove(local_id) {
            previous.cancel();
        }
        if let Some(timer) = timer {
            self.timers.insert(local_id.to_string(), timer);
        }
    }
}

fn transition(
    handle: MessageHandle,
    message: &Message,
    local_id: &str,
    changed: bool,
) -> EchoTransition {
    EchoTransition {
        handle,
        conversation: message.conversation.clone(),
        message_id: message.id.clone(),
        local_id: local_id.to_string(),
        status: message.status,
        changed,
    }
}
