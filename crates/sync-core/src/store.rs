//! In-memory conversation list and per-thread message lists.
//!
//! `ThreadStore` is the only holder of rendered state. Every mutation that
//! changes something bumps the revision and hands a fresh snapshot to each
//! subscribed observer. Message order within a thread is insertion order and
//! is never re-sorted by timestamp.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    dedup::Fingerprint,
    types::{Conversation, DeliveryState, Message, MessageContent, MessageId, Origin},
};

/// Observer invoked with a snapshot after every store change.
pub type ChangeCallback = Arc<dyn Fn(&StoreSnapshot) + Send + Sync + 'static>;

/// Errors returned by targeted store mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The referenced local entry is not in the thread.
    #[error("message '{id}' was not found in thread '{thread_id}'")]
    MissingMessage { thread_id: String, id: String },
    /// The entry is not in a state that allows the requested transition.
    #[error("message '{id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: String,
        from: DeliveryState,
        to: DeliveryState,
    },
}

/// Render-ready copy of the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub revision: u64,
    pub conversations: Vec<Conversation>,
    pub open_thread_id: Option<String>,
    /// Messages of the open thread, in display order.
    pub messages: Vec<Message>,
}

pub struct ThreadStore {
    conversations: Vec<Conversation>,
    open_thread_id: Option<String>,
    timelines: HashMap<String, Vec<Message>>,
    max_items: usize,
    revision: u64,
    observers: Vec<ChangeCallback>,
}

impl fmt::Debug for ThreadStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadStore")
            .field("conversations", &self.conversations.len())
            .field("open_thread_id", &self.open_thread_id)
            .field("timelines", &self.timelines.len())
            .field("max_items", &self.max_items)
            .field("revision", &self.revision)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ThreadStore {
    /// Create a store whose per-thread lists keep at most `max_items` entries.
    pub fn new(max_items: usize) -> Self {
        Self {
            conversations: Vec::new(),
            open_thread_id: None,
            timelines: HashMap::new(),
            max_items: max_items.max(1),
            revision: 0,
            observers: Vec::new(),
        }
    }

    /// Register an observer for every subsequent change.
    pub fn subscribe(&mut self, observer: ChangeCallback) {
        self.observers.push(observer);
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            revision: self.revision,
            conversations: self.conversations.clone(),
            open_thread_id: self.open_thread_id.clone(),
            messages: self
                .open_thread_id
                .as_ref()
                .map(|thread_id| self.messages(thread_id).to_vec())
                .unwrap_or_default(),
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn open_thread_id(&self) -> Option<&str> {
        self.open_thread_id.as_deref()
    }

    pub fn is_open(&self, thread_id: &str) -> bool {
        self.open_thread_id.as_deref() == Some(thread_id)
    }

    pub fn knows_conversation(&self, thread_id: &str) -> bool {
        self.conversations
            .iter()
            .any(|conversation| conversation.thread_id == thread_id)
    }

    /// Messages of a thread in display order.
    pub fn messages(&self, thread_id: &str) -> &[Message] {
        self.timelines
            .get(thread_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Replace the conversation list wholesale, keeping server order.
    pub fn replace_conversations(&mut self, conversations: Vec<Conversation>) {
        debug!(count = conversations.len(), "conversation list replaced");
        self.conversations = conversations;
        self.notify();
    }

    pub fn open_thread(&mut self, thread_id: impl Into<String>) {
        let thread_id = thread_id.into();
        if self.is_open(&thread_id) {
            return;
        }
        debug!(%thread_id, "thread opened");
        self.open_thread_id = Some(thread_id);
        self.notify();
    }

    pub fn close_thread(&mut self) {
        if self.open_thread_id.take().is_some() {
            self.notify();
        }
    }

    /// Replace a thread's list with fetched history (oldest first).
    ///
    /// Entries repeating a server id collapse to their last occurrence.
    /// Pending sends are carried over after the history unless the history
    /// already holds their server copy: an own entry new to this thread with
    /// the same fingerprint, stamped no earlier than the pending entry minus
    /// `clock_skew_ms`. Each history entry absorbs at most one pending send.
    ///
    /// Returns the fingerprints of the absorbed sends, oldest first.
    pub fn replace_history(
        &mut self,
        thread_id: &str,
        history: Vec<Message>,
        clock_skew_ms: u64,
    ) -> Vec<Fingerprint> {
        let pending: Vec<Message> = self
            .messages(thread_id)
            .iter()
            .filter(|message| message.delivery == DeliveryState::Pending)
            .cloned()
            .collect();

        let mut merged = dedupe_by_server_id(history);
        let mut copies: Vec<(Fingerprint, u64)> = merged
            .iter()
            .filter(|message| {
                message.origin == Origin::Own
                    && message
                        .id
                        .server_id()
                        .is_some_and(|server_id| !self.contains_server_id(thread_id, server_id))
            })
            .map(|message| (Fingerprint::of(&message.content), message.timestamp_ms))
            .collect();

        let mut absorbed = Vec::new();
        for entry in pending {
            let fingerprint = Fingerprint::of(&entry.content);
            let earliest = entry.timestamp_ms.saturating_sub(clock_skew_ms);
            let copy = copies.iter().position(|(candidate, timestamp_ms)| {
                *candidate == fingerprint && *timestamp_ms >= earliest
            });
            match copy {
                Some(index) => {
                    copies.remove(index);
                    debug!(%thread_id, id = %entry.id.as_str(), "pending send already in history");
                    absorbed.push(fingerprint);
                }
                None => merged.push(entry),
            }
        }

        trace!(%thread_id, count = merged.len(), "thread history replaced");
        self.timelines.insert(thread_id.to_owned(), merged);
        self.trim(thread_id);
        self.notify();
        absorbed
    }

    /// Update preview fields of a known conversation.
    ///
    /// Unknown threads are left alone: the list is owned by the list fetch.
    pub fn upsert_conversation_preview(
        &mut self,
        thread_id: &str,
        preview: impl Into<String>,
        timestamp_ms: u64,
    ) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|conversation| conversation.thread_id == thread_id)
        else {
            trace!(%thread_id, "preview update for unknown thread ignored");
            return false;
        };

        conversation.last_message_preview = Some(preview.into());
        conversation.last_message_at_ms = Some(timestamp_ms);
        self.notify();
        true
    }

    /// Append an unconfirmed self-origin entry.
    pub fn append_optimistic_message(
        &mut self,
        thread_id: &str,
        local_id: impl Into<String>,
        content: MessageContent,
        timestamp_ms: u64,
    ) {
        let message = Message {
            id: MessageId::Local(local_id.into()),
            thread_id: thread_id.to_owned(),
            origin: Origin::Own,
            sender_name: None,
            content,
            timestamp_ms,
            quote_id: None,
            delivery: DeliveryState::Pending,
        };
        self.push(message);
    }

    /// Oldest pending own entry whose content matches `fingerprint`.
    pub fn find_pending(&self, thread_id: &str, fingerprint: &Fingerprint) -> Option<String> {
        self.messages(thread_id)
            .iter()
            .find(|message| {
                message.origin == Origin::Own
                    && message.delivery == DeliveryState::Pending
                    && Fingerprint::of(&message.content) == *fingerprint
            })
            .and_then(|message| message.id.local_id().map(ToOwned::to_owned))
    }

    /// Confirm an optimistic entry in place, keeping its position.
    ///
    /// If the server id is already present (a history reload got there
    /// first) the optimistic entry is dropped instead.
    pub fn promote_optimistic_to_confirmed(
        &mut self,
        thread_id: &str,
        local_id: &str,
        server_id: &str,
        final_content: MessageContent,
        final_timestamp_ms: u64,
    ) -> Result<(), StoreError> {
        let already_present = self.contains_server_id(thread_id, server_id);
        let timeline = self
            .timelines
            .get_mut(thread_id)
            .ok_or_else(|| missing(thread_id, local_id))?;
        let index = timeline
            .iter()
            .position(|message| message.id.local_id() == Some(local_id))
            .ok_or_else(|| missing(thread_id, local_id))?;

        let from = timeline[index].delivery;
        if !from.can_advance_to(DeliveryState::Confirmed) {
            return Err(StoreError::InvalidTransition {
                id: local_id.to_owned(),
                from,
                to: DeliveryState::Confirmed,
            });
        }

        if already_present {
            warn!(%thread_id, %local_id, %server_id, "server id already present; dropping optimistic duplicate");
            timeline.remove(index);
        } else {
            let entry = &mut timeline[index];
            entry.id = MessageId::Server(server_id.to_owned());
            entry.content = final_content;
            entry.timestamp_ms = final_timestamp_ms;
            entry.delivery = DeliveryState::Confirmed;
        }
        self.notify();
        Ok(())
    }

    /// Append a confirmed entry unless its server id is already present.
    ///
    /// Returns `false` for a duplicate, in which case nothing changes.
    pub fn append_confirmed_message(&mut self, mut message: Message) -> bool {
        if let Some(server_id) = message.id.server_id()
            && self.contains_server_id(&message.thread_id, server_id)
        {
            trace!(thread_id = %message.thread_id, %server_id, "duplicate confirmed message ignored");
            return false;
        }
        message.delivery = DeliveryState::Confirmed;
        self.push(message);
        true
    }

    /// Move a pending entry to `Failed`.
    pub fn mark_failed(&mut self, thread_id: &str, local_id: &str) -> Result<(), StoreError> {
        let entry = self
            .timelines
            .get_mut(thread_id)
            .and_then(|items| {
                items
                    .iter_mut()
                    .find(|message| message.id.local_id() == Some(local_id))
            })
            .ok_or_else(|| missing(thread_id, local_id))?;

        if !entry.delivery.can_advance_to(DeliveryState::Failed) {
            return Err(StoreError::InvalidTransition {
                id: local_id.to_owned(),
                from: entry.delivery,
                to: DeliveryState::Failed,
            });
        }
        entry.delivery = DeliveryState::Failed;
        self.notify();
        Ok(())
    }

    /// Remove a local entry, used to roll back a failed send.
    pub fn remove_message(&mut self, thread_id: &str, local_id: &str) -> Result<Message, StoreError> {
        let timeline = self
            .timelines
            .get_mut(thread_id)
            .ok_or_else(|| missing(thread_id, local_id))?;
        let index = timeline
            .iter()
            .position(|message| message.id.local_id() == Some(local_id))
            .ok_or_else(|| missing(thread_id, local_id))?;

        let removed = timeline.remove(index);
        self.notify();
        Ok(removed)
    }

    /// Append a locally synthesized notice entry.
    pub fn append_notice(&mut self, thread_id: &str, text: impl Into<String>, timestamp_ms: u64) {
        let message = Message {
            id: MessageId::new_local(),
            thread_id: thread_id.to_owned(),
            origin: Origin::System,
            sender_name: None,
            content: MessageContent::notice(text),
            timestamp_ms,
            quote_id: None,
            delivery: DeliveryState::Confirmed,
        };
        self.push(message);
    }

    fn contains_server_id(&self, thread_id: &str, server_id: &str) -> bool {
        self.messages(thread_id)
            .iter()
            .any(|message| message.id.server_id() == Some(server_id))
    }

    fn push(&mut self, message: Message) {
        let thread_id = message.thread_id.clone();
        self.timelines
            .entry(thread_id.clone())
            .or_default()
            .push(message);
        self.trim(&thread_id);
        self.notify();
    }

    fn trim(&mut self, thread_id: &str) {
        let Some(timeline) = self.timelines.get_mut(thread_id) else {
            return;
        };
        if timeline.len() <= self.max_items {
            return;
        }
        let excess = timeline.len() - self.max_items;
        timeline.drain(0..excess);
    }

    fn notify(&mut self) {
        self.revision = self.revision.wrapping_add(1);
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        for observer in &self.observers {
            observer(&snapshot);
        }
    }
}

fn missing(thread_id: &str, id: &str) -> StoreError {
    StoreError::MissingMessage {
        thread_id: thread_id.to_owned(),
        id: id.to_owned(),
    }
}

fn dedupe_by_server_id(items: Vec<Message>) -> Vec<Message> {
    let mut seen = HashSet::new();
    let mut reversed = Vec::with_capacity(items.len());

    for item in items.into_iter().rev() {
        let keep = match item.id.server_id() {
            Some(server_id) => seen.insert(server_id.to_owned()),
            None => true,
        };
        if keep {
            reversed.push(item);
        }
    }

    reversed.reverse();
    reversed
}
