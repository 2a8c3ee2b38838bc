//! Local message model and the per-conversation thread store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

use crate::ids::{ConversationIdKey, MessageId, OutboxId, Username};
use crate::ordinal::{Ordinal, OrdinalAllocator};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    Text {
        text: String,
    },
    Attachment {
        title: String,
        file_name: String,
        preview_url: Option<String>,
        /// Coarse upload progress in `[0, 1]`, `None` once uploaded.
        upload_ratio: Option<f32>,
    },
    /// Anything the engine only displays (joins, system notices...).
    Other { kind: String },
}

impl MessageBody {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Kinds a history deletion is allowed to remove.
    #[must_use]
    pub const fn deletable_by_history(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::Attachment { .. })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Pending,
    Sent,
    Failed { reason: String },
    Exploded { by: Option<Username> },
    Deleted,
}

pub type Reactions = BTreeMap<String, BTreeSet<Username>>;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Message {
    pub conversation: ConversationIdKey,
    pub ordinal: Ordinal,
    pub id: Option<MessageId>,
    pub outbox_id: Option<OutboxId>,
    pub author: Username,
    pub timestamp_ms: u64,
    pub body: MessageBody,
    pub state: MessageState,
    pub exploding_lifetime_secs: Option<u64>,
    pub reactions: Reactions,
}

impl Message {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == MessageState::Pending
    }

    #[must_use]
    pub const fn is_exploding(&self) -> bool {
        self.exploding_lifetime_secs.is_some()
    }
}

/// A message as delivered by the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RemoteMessage {
    pub id: MessageId,
    #[serde(default)]
    pub outbox_id: Option<OutboxId>,
    pub author: Username,
    #[serde(default)]
    pub timestamp_ms: u64,
    pub body: MessageBody,
    #[serde(default)]
    pub exploding_lifetime_secs: Option<u64>,
    #[serde(default)]
    pub exploded_by: Option<Username>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub reactions: Reactions,
}

impl RemoteMessage {
    fn state(&self) -> MessageState {
        if self.deleted {
            MessageState::Deleted
        } else if self.exploded_by.is_some() {
            MessageState::Exploded {
                by: self.exploded_by.clone(),
            }
        } else {
            MessageState::Sent
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct Pagination {
    pub next: Option<String>,
    pub last: bool,
}

/// One page (partial or complete) of a thread fetch.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ThreadPage {
    pub conversation: ConversationIdKey,
    pub messages: Vec<RemoteMessage>,
    pub pagination: Option<Pagination>,
}

/// What an edit points at: the server id once known, otherwise the outbox id
/// of a send still in flight.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EditTarget {
    pub message_id: Option<MessageId>,
    pub outbox_id: Option<OutboxId>,
}

/// A not-yet-confirmed message to insert locally.
#[derive(Clone, Debug)]
pub struct PendingMessage {
    pub outbox_id: OutboxId,
    pub author: Username,
    pub timestamp_ms: u64,
    pub body: MessageBody,
    pub exploding_lifetime_secs: Option<u64>,
}

#[derive(Debug, Default)]
struct Thread {
    by_ordinal: BTreeMap<Ordinal, Message>,
    by_outbox: HashMap<OutboxId, Ordinal>,
    by_id: HashMap<MessageId, Ordinal>,
}

impl Thread {
    fn insert(&mut self, message: Message) {
        if let Some(outbox_id) = &message.outbox_id {
            self.by_outbox.insert(outbox_id.clone(), message.ordinal);
        }
        if let Some(id) = message.id {
            self.by_id.insert(id, message.ordinal);
        }
        self.by_ordinal.insert(message.ordinal, message);
    }

    fn remove(&mut self, ordinal: Ordinal) -> Option<Message> {
        let message = self.by_ordinal.remove(&ordinal)?;
        if let Some(outbox_id) = &message.outbox_id {
            self.by_outbox.remove(outbox_id);
        }
        if let Some(id) = message.id {
            self.by_id.remove(&id);
        }
        Some(message)
    }

    fn by_outbox_mut(&mut self, outbox_id: &OutboxId) -> Option<&mut Message> {
        let ordinal = self.by_outbox.get(outbox_id)?;
        self.by_ordinal.get_mut(ordinal)
    }

    fn by_id_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let ordinal = self.by_id.get(&id)?;
        self.by_ordinal.get_mut(ordinal)
    }
}

/// All locally known messages, keyed by conversation then ordinal.
#[derive(Debug, Default)]
pub struct MessageStore {
    threads: HashMap<ConversationIdKey, Thread>,
    ordinals: OrdinalAllocator,
}

impl MessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an optimistic message after everything known in the
    /// conversation and returns its ordinal.
    pub fn insert_pending(&mut self, conversation: &ConversationIdKey, pending: PendingMessage) -> Ordinal {
        let ordinal = self.ordinals.next_pending(conversation);
        let message = Message {
            conversation: conversation.clone(),
            ordinal,
            id: None,
            outbox_id: Some(pending.outbox_id),
            author: pending.author,
            timestamp_ms: pending.timestamp_ms,
            body: pending.body,
            state: MessageState::Pending,
            exploding_lifetime_secs: pending.exploding_lifetime_secs,
            reactions: Reactions::new(),
        };
        debug!(conversation = %conversation, %ordinal, "inserted pending message");
        self.threads.entry(conversation.clone()).or_default().insert(message);
        ordinal
    }

    /// Folds service messages into a conversation.
    ///
    /// A message whose outbox id matches a local pending message upgrades it
    /// in place and keeps its ordinal. With `clear_existing`, messages that
    /// came from the service are dropped first. Messages sent from here keep
    /// their fractional ordinals through the clear, confirmed or not.
    pub fn add(&mut self, conversation: &ConversationIdKey, incoming: Vec<RemoteMessage>, clear_existing: bool) {
        let thread = self.threads.entry(conversation.clone()).or_default();
        if clear_existing {
            let remote: Vec<Ordinal> = thread
                .by_ordinal
                .values()
                .filter(|m| m.id.is_some() && m.ordinal.is_integral())
                .map(|m| m.ordinal)
                .collect();
            for ordinal in remote {
                thread.remove(ordinal);
            }
        }

        for remote in incoming {
            let state = remote.state();
            let upgraded = match remote.outbox_id.as_ref().and_then(|o| thread.by_outbox.get(o)) {
                Some(&ordinal) => Some(ordinal),
                None => thread.by_id.get(&remote.id).copied(),
            };

            if let Some(ordinal) = upgraded {
                let Some(existing) = thread.by_ordinal.get_mut(&ordinal) else {
                    continue;
                };
                if existing.id.is_some_and(|id| id != remote.id) {
                    warn!(
                        conversation = %conversation,
                        existing = ?existing.id,
                        incoming = %remote.id,
                        "message id is immutable, ignoring conflicting update"
                    );
                    continue;
                }
                existing.id = Some(remote.id);
                existing.body = remote.body;
                existing.state = state;
                existing.timestamp_ms = remote.timestamp_ms;
                existing.exploding_lifetime_secs = remote.exploding_lifetime_secs;
                existing.reactions = remote.reactions;
                thread.by_id.insert(remote.id, ordinal);
                continue;
            }

            let ordinal = Ordinal::for_message(remote.id);
            self.ordinals.observe(conversation, ordinal);
            thread.insert(Message {
                conversation: conversation.clone(),
                ordinal,
                id: Some(remote.id),
                outbox_id: remote.outbox_id,
                author: remote.author,
                timestamp_ms: remote.timestamp_ms,
                body: remote.body,
                state,
                exploding_lifetime_secs: remote.exploding_lifetime_secs,
                reactions: remote.reactions,
            });
        }
    }

    /// Replaces messages matched by server id, keeping their ordinals.
    /// Unknown ids are ignored.
    pub fn update_existing(&mut self, conversation: &ConversationIdKey, updates: Vec<RemoteMessage>) {
        let Some(thread) = self.threads.get_mut(conversation) else {
            return;
        };
        for remote in updates {
            let state = remote.state();
            if let Some(existing) = thread.by_id_mut(remote.id) {
                existing.body = remote.body;
                existing.state = state;
                existing.reactions = remote.reactions;
            }
        }
    }

    /// Records the server id for a pending message. The ordinal stays put;
    /// an id that is already set never changes.
    pub fn mark_sent(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId, id: MessageId) -> bool {
        let Some(thread) = self.threads.get_mut(conversation) else {
            return false;
        };
        let Some(message) = thread.by_outbox_mut(outbox_id) else {
            return false;
        };
        if message.id.is_some() {
            return false;
        }
        message.id = Some(id);
        if message.state == MessageState::Pending || matches!(message.state, MessageState::Failed { .. }) {
            message.state = MessageState::Sent;
        }
        let ordinal = message.ordinal;
        thread.by_id.insert(id, ordinal);
        true
    }

    pub fn mark_failed(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId, reason: impl Into<String>) -> bool {
        let Some(message) = self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_outbox_mut(outbox_id))
        else {
            return false;
        };
        if message.id.is_some() {
            return false;
        }
        message.state = MessageState::Failed {
            reason: reason.into(),
        };
        true
    }

    /// Puts a failed message back to pending ahead of a retry.
    pub fn mark_retrying(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId) -> bool {
        match self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_outbox_mut(outbox_id))
        {
            Some(message) if matches!(message.state, MessageState::Failed { .. }) => {
                message.state = MessageState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Idempotent: exploding an already exploded message changes nothing.
    pub fn mark_exploded(&mut self, conversation: &ConversationIdKey, ids: &[MessageId], by: Option<&Username>) {
        let Some(thread) = self.threads.get_mut(conversation) else {
            return;
        };
        for id in ids {
            if let Some(message) = thread.by_id_mut(*id) {
                if matches!(message.state, MessageState::Exploded { .. }) {
                    continue;
                }
                message.state = MessageState::Exploded { by: by.cloned() };
                message.reactions.clear();
            }
        }
    }

    /// Idempotent delete-mark by server id.
    pub fn mark_deleted(&mut self, conversation: &ConversationIdKey, ids: &[MessageId]) {
        let Some(thread) = self.threads.get_mut(conversation) else {
            return;
        };
        for id in ids {
            if let Some(message) = thread.by_id_mut(*id) {
                message.state = MessageState::Deleted;
            }
        }
    }

    pub fn mark_deleted_local(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId) {
        if let Some(message) = self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_outbox_mut(outbox_id))
        {
            message.state = MessageState::Deleted;
        }
    }

    /// Removes every history-deletable message with a server id below `upto`.
    pub fn expunge(&mut self, conversation: &ConversationIdKey, upto: MessageId) -> usize {
        let Some(thread) = self.threads.get_mut(conversation) else {
            return 0;
        };
        let doomed: Vec<Ordinal> = thread
            .by_ordinal
            .values()
            .filter(|m| m.id.is_some_and(|id| id < upto) && m.body.deletable_by_history())
            .map(|m| m.ordinal)
            .collect();
        for ordinal in &doomed {
            thread.remove(*ordinal);
        }
        doomed.len()
    }

    /// Replaces the text of a text message. Returns false when the target is
    /// unknown or not text.
    pub fn set_text(&mut self, conversation: &ConversationIdKey, ordinal: Ordinal, text: &str) -> bool {
        match self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_ordinal.get_mut(&ordinal))
        {
            Some(message) if message.body.is_text() => {
                message.body = MessageBody::text(text);
                true
            }
            _ => false,
        }
    }

    pub fn set_text_by_id(&mut self, conversation: &ConversationIdKey, id: MessageId, text: &str) -> bool {
        let ordinal = self
            .threads
            .get(conversation)
            .and_then(|t| t.by_id.get(&id))
            .copied();
        ordinal.is_some_and(|o| self.set_text(conversation, o, text))
    }

    pub fn set_text_by_outbox(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId, text: &str) -> bool {
        let ordinal = self
            .threads
            .get(conversation)
            .and_then(|t| t.by_outbox.get(outbox_id))
            .copied();
        ordinal.is_some_and(|o| self.set_text(conversation, o, text))
    }

    pub fn set_reactions(&mut self, conversation: &ConversationIdKey, id: MessageId, reactions: Reactions) {
        if let Some(message) = self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_id_mut(id))
        {
            message.reactions = reactions;
        }
    }

    /// Adds or removes `user` from the emoji's reactors.
    pub fn toggle_reaction(&mut self, conversation: &ConversationIdKey, id: MessageId, emoji: &str, user: &Username) {
        let Some(message) = self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_id_mut(id))
        else {
            return;
        };
        let users = message.reactions.entry(emoji.to_owned()).or_default();
        if !users.remove(user) {
            users.insert(user.clone());
        }
        if users.is_empty() {
            message.reactions.remove(emoji);
        }
    }

    pub fn set_upload_ratio(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId, ratio: Option<f32>) {
        if let Some(message) = self
            .threads
            .get_mut(conversation)
            .and_then(|t| t.by_outbox_mut(outbox_id))
        {
            if let MessageBody::Attachment { upload_ratio, .. } = &mut message.body {
                *upload_ratio = ratio;
            }
        }
    }

    #[must_use]
    pub fn get(&self, conversation: &ConversationIdKey, ordinal: Ordinal) -> Option<&Message> {
        self.threads.get(conversation)?.by_ordinal.get(&ordinal)
    }

    #[must_use]
    pub fn by_outbox(&self, conversation: &ConversationIdKey, outbox_id: &OutboxId) -> Option<&Message> {
        let thread = self.threads.get(conversation)?;
        thread.by_ordinal.get(thread.by_outbox.get(outbox_id)?)
    }

    #[must_use]
    pub fn by_id(&self, conversation: &ConversationIdKey, id: MessageId) -> Option<&Message> {
        let thread = self.threads.get(conversation)?;
        thread.by_ordinal.get(thread.by_id.get(&id)?)
    }

    /// Messages of a conversation in ordinal order.
    pub fn messages(&self, conversation: &ConversationIdKey) -> impl Iterator<Item = &Message> {
        self.threads
            .get(conversation)
            .into_iter()
            .flat_map(|t| t.by_ordinal.values())
    }

    #[must_use]
    pub fn newest_confirmed_id(&self, conversation: &ConversationIdKey) -> Option<MessageId> {
        self.threads.get(conversation)?.by_id.keys().max().copied()
    }

    /// Moves local messages staged under one key (e.g. a pending
    /// conversation) to their resolved conversation.
    pub fn rekey(&mut self, from: &ConversationIdKey, to: &ConversationIdKey) {
        let Some(old) = self.threads.remove(from) else {
            return;
        };
        self.ordinals.forget(from);
        for (_, mut message) in old.by_ordinal {
            message.conversation = to.clone();
            message.ordinal = self.ordinals.next_pending(to);
            self.threads.entry(to.clone()).or_default().insert(message);
        }
    }

    pub fn remove_conversation(&mut self, conversation: &ConversationIdKey) {
        self.threads.remove(conversation);
        self.ordinals.forget(conversation);
    }

    pub fn clear(&mut self) {
        self.threads.clear();
        self.ordinals.clear();
    }
}
