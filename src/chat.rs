// Message thread synchronizer
// Sends are optimistic: a pending message shows up at once under a temp id and
// is replaced by the server copy when the send (or its echo) comes back.

use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;

use crate::error::{SyncError, ValidationError};
use crate::ledger::{EntryState, Ledger, LedgerEntity};
use crate::models::{ChatRoomId, DeliveryState, Identity, InboundMessage, Message, MessageId, TempId, UserId};

impl LedgerEntity for Message {
    type Key = MessageId;

    fn identity(&self) -> Identity<MessageId> {
        self.identity.clone()
    }
}

pub struct ChatThread {
    pub id: ChatRoomId,
    pub participants: Vec<UserId>,
    pub unread_count: u32,
    messages: Ledger<Message>,
}

impl ChatThread {
    pub fn new(id: impl Into<ChatRoomId>, participants: Vec<UserId>) -> Self {
        ChatThread {
            id: id.into(),
            participants,
            unread_count: 0,
            messages: Ledger::new(),
        }
    }

    /// Messages in timestamp order, pending and failed ones included
    pub fn messages(&self) -> impl Iterator<Item = (&Message, EntryState)> {
        self.messages.iter()
    }

    pub fn message(&self, identity: &Identity<MessageId>) -> Option<&Message> {
        self.messages.get(identity)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn confirmed_count(&self) -> usize {
        self.messages.confirmed().count()
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    fn has_participant(&self, user_id: &str) -> bool {
        self.participants.is_empty() || self.participants.iter().any(|p| p == user_id)
    }
}

/// A message ready to go out; hand the result back to `ChatStore::complete_send`
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub temp_id: TempId,
    pub chat_room_id: ChatRoomId,
    pub content: String,
}

#[derive(Default)]
pub struct ChatStore {
    viewer: Option<UserId>,
    threads: HashMap<ChatRoomId, ChatThread>,
    active: Option<ChatRoomId>,
}

impl ChatStore {
    pub fn new(viewer: Option<UserId>) -> Self {
        ChatStore {
            viewer,
            ..Default::default()
        }
    }

    pub fn set_viewer(&mut self, viewer: UserId) {
        self.viewer = Some(viewer);
    }

    pub fn viewer(&self) -> Option<&str> {
        self.viewer.as_deref()
    }

    /// Evaluated against the current viewer, which may have loaded after the message
    pub fn is_own(&self, message: &Message) -> bool {
        message.is_own(self.viewer.as_deref())
    }

    pub fn thread(&self, thread_id: &str) -> Option<&ChatThread> {
        self.threads.get(thread_id)
    }

    pub fn threads(&self) -> impl Iterator<Item = &ChatThread> {
        self.threads.values()
    }

    pub fn active_thread(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn total_unread(&self) -> u32 {
        self.threads.values().map(|t| t.unread_count).sum()
    }

    /// Register a thread from the server's thread list
    pub fn add_thread(&mut self, thread_id: &str, participants: Vec<UserId>, unread_count: u32) {
        let thread = self
            .threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ChatThread::new(thread_id, Vec::new()));
        thread.participants = participants;
        thread.unread_count = unread_count;
    }

    fn thread_mut(&mut self, thread_id: &str) -> &mut ChatThread {
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ChatThread::new(thread_id, Vec::new()))
    }

    pub fn open_thread(&mut self, thread_id: &str) -> Result<(), ValidationError> {
        let thread = self
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| ValidationError::UnknownThread(thread_id.to_string()))?;
        thread.unread_count = 0;
        self.active = Some(thread_id.to_string());
        debug!("Opened thread {}", thread_id);
        Ok(())
    }

    /// Leaves counters untouched; only stops treating the thread as on screen
    pub fn close_thread(&mut self, thread_id: &str) {
        if self.active.as_deref() == Some(thread_id) {
            self.active = None;
        }
    }

    pub fn begin_send(&mut self, thread_id: &str, content: &str) -> Result<OutgoingMessage, ValidationError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        let viewer = self.viewer.clone().ok_or(ValidationError::ViewerUnknown)?;
        let thread = self
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| ValidationError::UnknownThread(thread_id.to_string()))?;
        if !thread.has_participant(&viewer) {
            return Err(ValidationError::NotParticipant);
        }

        let temp_id = TempId::new();
        thread.messages.begin_optimistic_insert(
            temp_id,
            Message {
                identity: Identity::Temp(temp_id),
                chat_room_id: thread_id.to_string(),
                content: content.to_string(),
                sender_id: viewer,
                timestamp: Utc::now(),
                delivery_state: DeliveryState::Pending,
            },
        );
        thread.sort();
        Ok(OutgoingMessage {
            temp_id,
            chat_room_id: thread_id.to_string(),
            content: content.to_string(),
        })
    }

    fn thread_holding(&mut self, temp_id: TempId) -> Option<&mut ChatThread> {
        self.threads.values_mut().find(|t| t.messages.is_pending(temp_id))
    }

    /// Apply the outcome of a send. A timed-out send stays pending; the echo decides.
    pub fn complete_send(&mut self, temp_id: TempId, outcome: Result<InboundMessage, SyncError>) -> Result<(), SyncError> {
        let Some(thread) = self.thread_holding(temp_id) else {
            debug!("Send {} already reconciled", temp_id);
            return outcome.map(|_| ());
        };

        match outcome {
            Ok(inbound) => {
                let confirmation = thread.messages.confirm(temp_id, inbound.into());
                thread.sort();
                debug!("Send {} confirmed ({:?})", temp_id, confirmation);
                Ok(())
            }
            Err(e) if e.is_ambiguous() => {
                warn!("Send {} outcome unknown: {}", temp_id, e);
                Err(e)
            }
            Err(e) => {
                let reason = e.to_string();
                thread.messages.reject(temp_id, &reason);
                thread
                    .messages
                    .update_base(&Identity::Temp(temp_id), |m| m.delivery_state = DeliveryState::Failed);
                info!("Send {} failed: {}", temp_id, reason);
                Err(SyncError::DeliveryFailure(reason))
            }
        }
    }

    /// Put a failed message back into flight under its original temp id
    pub fn retry_send(&mut self, thread_id: &str, temp_id: TempId) -> Result<OutgoingMessage, ValidationError> {
        let thread = self
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| ValidationError::UnknownThread(thread_id.to_string()))?;
        let identity = Identity::Temp(temp_id);
        if thread.messages.state(&identity) != Some(EntryState::Failed) {
            return Err(ValidationError::NotFailed);
        }
        thread.messages.retry(temp_id);
        let message = thread
            .messages
            .update_base(&identity, |m| m.delivery_state = DeliveryState::Pending)
            .ok_or(ValidationError::NotFailed)?;
        Ok(OutgoingMessage {
            temp_id,
            chat_room_id: thread_id.to_string(),
            content: message.content.clone(),
        })
    }

    /// Upsert a pushed message. Returns true if it was new to the thread.
    pub fn receive_inbound(&mut self, inbound: InboundMessage) -> bool {
        let thread_id = inbound.chat_room_id.clone();
        let is_active = self.active.as_deref() == Some(thread_id.as_str());
        let viewer = self.viewer.clone();
        let thread = self.thread_mut(&thread_id);

        if let Some(temp_id) = inbound.temp_id {
            if thread.messages.is_pending(temp_id) {
                thread.messages.confirm(temp_id, inbound.into());
                thread.sort();
                debug!("Echo confirmed {} in thread {}", temp_id, thread_id);
                return false;
            }
        }

        let is_new = thread.messages.get_by_key(&inbound.id).is_none();
        let message: Message = inbound.into();
        let counts_as_unread = match viewer.as_deref() {
            Some(_) => !message.is_own(viewer.as_deref()),
            None => false,
        };
        thread.messages.reconcile_external(message);
        thread.sort();

        if is_new && counts_as_unread && !is_active {
            thread.unread_count += 1;
        }
        is_new
    }

    /// Merge a fetched page of history; never touches unread counts
    pub fn merge_history(&mut self, thread_id: &str, history: Vec<InboundMessage>) {
        let thread = self.thread_mut(thread_id);
        for inbound in history {
            match inbound.temp_id {
                Some(temp_id) if thread.messages.is_pending(temp_id) => {
                    thread.messages.confirm(temp_id, inbound.into());
                }
                _ => {
                    thread.messages.reconcile_external(inbound.into());
                }
            }
        }
        thread.sort();
    }
}
