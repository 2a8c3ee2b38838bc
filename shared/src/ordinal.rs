//! Total-order positions for messages within a conversation.
//!
//! Confirmed messages sit on integral slots (their server id). Optimistic
//! messages take a fractional slot after the newest known ordinal, so they
//! never force existing messages to be renumbered.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::ids::{ConversationIdKey, MessageId};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ordinal {
    whole: u64,
    fraction: u32,
}

impl Ordinal {
    pub const ZERO: Self = Self { whole: 0, fraction: 0 };

    #[must_use]
    pub const fn integral(whole: u64) -> Self {
        Self { whole, fraction: 0 }
    }

    #[must_use]
    pub const fn for_message(id: MessageId) -> Self {
        Self::integral(id.0)
    }

    /// The next slot strictly between `self` and the next integral ordinal.
    #[must_use]
    pub const fn next_fractional(self) -> Self {
        Self {
            whole: self.whole,
            fraction: self.fraction.saturating_add(1),
        }
    }

    #[must_use]
    pub const fn is_integral(self) -> bool {
        self.fraction == 0
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fraction == 0 {
            write!(f, "{}", self.whole)
        } else {
            write!(f, "{}.{:03}", self.whole, self.fraction)
        }
    }
}

/// Tracks the newest ordinal per conversation and hands out pending slots.
#[derive(Debug, Default)]
pub struct OrdinalAllocator {
    last: HashMap<ConversationIdKey, Ordinal>,
}

impl OrdinalAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest ordinal known for the conversation, `Ordinal::ZERO` if none.
    #[must_use]
    pub fn last(&self, conversation: &ConversationIdKey) -> Ordinal {
        self.last.get(conversation).copied().unwrap_or(Ordinal::ZERO)
    }

    /// Records an ordinal that entered the conversation from any source.
    pub fn observe(&mut self, conversation: &ConversationIdKey, ordinal: Ordinal) {
        let last = self.last.entry(conversation.clone()).or_insert(Ordinal::ZERO);
        if ordinal > *last {
            *last = ordinal;
        }
    }

    /// Allocates a pending ordinal strictly after everything seen so far.
    pub fn next_pending(&mut self, conversation: &ConversationIdKey) -> Ordinal {
        let next = self.last(conversation).next_fractional();
        self.last.insert(conversation.clone(), next);
        next
    }

    pub fn forget(&mut self, conversation: &ConversationIdKey) {
        self.last.remove(conversation);
    }

    pub fn clear(&mut self) {
        self.last.clear();
    }
}
