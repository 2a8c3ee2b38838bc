use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(Username);
typed_id!(TeamName);

/// Identity of a conversation as seen by the client.
///
/// Only `Resolved` keys may be sent to the remote service; the other variants
/// are local sentinels.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationIdKey {
    Resolved(String),
    NoConversation,
    Pending,
    PendingWaiting,
}

impl ConversationIdKey {
    /// Builds a key from a service conversation id. An empty id maps to
    /// `NoConversation`.
    pub fn resolved(id: impl Into<String>) -> Self {
        let id = id.into();
        if id.trim().is_empty() {
            Self::NoConversation
        } else {
            Self::Resolved(id)
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }

    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::PendingWaiting)
    }

    #[must_use]
    pub fn as_resolved(&self) -> Option<&str> {
        match self {
            Self::Resolved(id) => Some(id),
            _ => None,
        }
    }
}

impl Default for ConversationIdKey {
    fn default() -> Self {
        Self::NoConversation
    }
}

impl fmt::Display for ConversationIdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(id) => f.write_str(id),
            Self::NoConversation => f.write_str("<none>"),
            Self::Pending => f.write_str("<pending>"),
            Self::PendingWaiting => f.write_str("<pending-waiting>"),
        }
    }
}

/// Locally generated correlation id for a send/edit/delete intent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutboxId(String);

impl OutboxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-assigned message id. Immutable once a message has one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Builds the tlf name the service uses to look up an implicit-team
/// conversation: the sorted, de-duplicated participant list joined by commas.
pub fn tlf_name_for<'a>(users: impl IntoIterator<Item = &'a Username>, you: &Username) -> String {
    let mut names: Vec<&str> = users.into_iter().map(Username::as_str).collect();
    names.push(you.as_str());
    names.sort_unstable();
    names.dedup();
    names.join(",")
}
