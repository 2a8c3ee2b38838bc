//! Correlates asynchronous service notifications with the local intent that
//! produced them.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::debug;

use crate::ids::{ConversationIdKey, MessageId, OutboxId};
use crate::message::EditTarget;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboxError {
    #[error("duplicate outbox id: {0}")]
    Duplicate(OutboxId),

    #[error("entry not found: {0}")]
    NotFound(OutboxId),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxIntent {
    Send { text: String },
    Attachment { file_name: String, title: String },
    Edit { target: EditTarget, text: String },
    Delete { target: Option<MessageId> },
}

impl OutboxIntent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Send { .. } => "send",
            Self::Attachment { .. } => "attachment",
            Self::Edit { .. } => "edit",
            Self::Delete { .. } => "delete",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OutboxEntry {
    pub outbox_id: OutboxId,
    pub intent: OutboxIntent,
    pub conversation: ConversationIdKey,
    pub attempts: u32,
    pub last_forwarded_ratio: f32,
    /// The send's text changed after it went out.
    pub edited: bool,
}

impl OutboxEntry {
    #[must_use]
    pub fn new(outbox_id: OutboxId, intent: OutboxIntent, conversation: ConversationIdKey) -> Self {
        Self {
            outbox_id,
            intent,
            conversation,
            attempts: 0,
            last_forwarded_ratio: 0.0,
            edited: false,
        }
    }
}

/// Live intents plus a bounded memory of recently resolved ids. A resolved
/// send that was edited in flight keeps its edited text there until its echo
/// shows up.
#[derive(Debug)]
pub struct Outbox {
    entries: HashMap<OutboxId, OutboxEntry>,
    resolved: LruCache<OutboxId, Option<String>>,
    capacity: NonZeroUsize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_RESOLVED_OUTBOX_MEMORY)
    }
}

impl Outbox {
    #[must_use]
    pub fn new(resolved_memory: usize) -> Self {
        let capacity = NonZeroUsize::new(resolved_memory).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: HashMap::new(),
            resolved: LruCache::new(capacity),
            capacity,
        }
    }

    #[must_use]
    pub const fn resolved_memory(&self) -> usize {
        self.capacity.get()
    }

    /// Shrinking drops the least recently resolved ids first.
    pub fn set_resolved_memory(&mut self, resolved_memory: usize) {
        let capacity = NonZeroUsize::new(resolved_memory).unwrap_or(NonZeroUsize::MIN);
        if capacity != self.capacity {
            debug!(capacity = capacity.get(), "resizing resolved outbox memory");
            self.resolved.resize(capacity);
            self.capacity = capacity;
        }
    }

    pub fn track(&mut self, entry: OutboxEntry) -> Result<(), OutboxError> {
        if self.entries.contains_key(&entry.outbox_id) {
            return Err(OutboxError::Duplicate(entry.outbox_id));
        }
        debug!(
            outbox_id = %entry.outbox_id,
            intent = entry.intent.name(),
            conversation = %entry.conversation,
            "tracking outbox entry"
        );
        self.entries.insert(entry.outbox_id.clone(), entry);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, outbox_id: &OutboxId) -> Option<&OutboxEntry> {
        self.entries.get(outbox_id)
    }

    pub fn get_mut(&mut self, outbox_id: &OutboxId) -> Option<&mut OutboxEntry> {
        self.entries.get_mut(outbox_id)
    }

    /// Counts one more send attempt for the entry.
    pub fn record_attempt(&mut self, outbox_id: &OutboxId) -> Result<u32, OutboxError> {
        let entry = self
            .entries
            .get_mut(outbox_id)
            .ok_or_else(|| OutboxError::NotFound(outbox_id.clone()))?;
        entry.attempts += 1;
        Ok(entry.attempts)
    }

    /// Removes a settled entry and remembers its id.
    pub fn resolve(&mut self, outbox_id: &OutboxId) -> Option<OutboxEntry> {
        let entry = self.entries.remove(outbox_id)?;
        let edited = match &entry.intent {
            OutboxIntent::Send { text } if entry.edited => Some(text.clone()),
            _ => None,
        };
        self.resolved.put(outbox_id.clone(), edited);
        Some(entry)
    }

    #[must_use]
    pub fn was_resolved(&self, outbox_id: &OutboxId) -> bool {
        self.resolved.contains(outbox_id)
    }

    /// Replaces the text of a send that has not been confirmed yet.
    pub fn edit_send(&mut self, outbox_id: &OutboxId, text: &str) -> bool {
        match self.entries.get_mut(outbox_id) {
            Some(OutboxEntry {
                intent: OutboxIntent::Send { text: queued },
                edited,
                ..
            }) => {
                text.clone_into(queued);
                *edited = true;
                true
            }
            _ => false,
        }
    }

    /// Hands out, once, the text a resolved send was edited to in flight.
    pub fn take_edited_text(&mut self, outbox_id: &OutboxId) -> Option<String> {
        self.resolved.get_mut(outbox_id).and_then(Option::take)
    }

    /// Returns the ratio when it moved more than `step` past the last value
    /// forwarded for this entry.
    pub fn forward_progress(&mut self, outbox_id: &OutboxId, ratio: f32, step: f32) -> Option<f32> {
        let entry = self.entries.get_mut(outbox_id)?;
        let ratio = ratio.clamp(0.0, 1.0);
        if ratio - entry.last_forwarded_ratio > step {
            entry.last_forwarded_ratio = ratio;
            Some(ratio)
        } else {
            None
        }
    }

    pub fn reset_progress(&mut self, outbox_id: &OutboxId, ratio: f32) {
        if let Some(entry) = self.entries.get_mut(outbox_id) {
            entry.last_forwarded_ratio = ratio;
        }
    }

    /// Moves entries staged under a sentinel onto a resolved conversation.
    pub fn rekey(&mut self, from: &ConversationIdKey, to: &ConversationIdKey) {
        for entry in self.entries.values_mut().filter(|e| &e.conversation == from) {
            entry.conversation = to.clone();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
