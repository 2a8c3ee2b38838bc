//! Follow-up work produced by the reducer. The host turns each command into a
//! capability request; replies re-enter as [`EngineEvent::RemoteSettled`].
//!
//! [`EngineEvent::RemoteSettled`]: crate::engine::EngineEvent::RemoteSettled

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::capabilities::RemoteCall;
use crate::engine::EngineEvent;
use crate::error::{EngineError, Notice};
use crate::ids::{ConversationIdKey, MessageId, OutboxId, TeamName, Username};
use crate::inbox::RefreshReason;
use crate::message::EditTarget;
use crate::paginator::LoadId;

/// What a remote reply is for. Carries the state captured when the request
/// went out, so the handler can tell a stale reply from a current one.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "tag", rename_all = "snake_case")]
pub enum ReplyTag {
    Inbox {
        reason: RefreshReason,
    },
    Unbox {
        conversations: Vec<ConversationIdKey>,
    },
    Thread {
        load_id: LoadId,
    },
    Post {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    Edit {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
        target: EditTarget,
        text: String,
    },
    Delete {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
        target: Option<MessageId>,
    },
    Reaction {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
        target: MessageId,
        emoji: String,
    },
    Placeholder {
        batch: u64,
    },
    Preview {
        batch: u64,
    },
    Upload {
        batch: u64,
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    FindExisting {
        participants: BTreeSet<Username>,
    },
    FindTeamChannel {
        team: TeamName,
        channel: String,
    },
    Create {
        participants: BTreeSet<Username>,
    },
    Leave {
        conversation: ConversationIdKey,
        avoid_team: Option<TeamName>,
    },
    Block {
        conversation: ConversationIdKey,
    },
    ExplodingMode {
        conversation: ConversationIdKey,
        seconds: u64,
    },
    /// Nothing to reconcile beyond logging failures.
    Fire {
        what: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Remote { tag: ReplyTag, call: RemoteCall },
    Schedule { after: Duration, event: EngineEvent },
    Render,
    /// Show a top-level notice.
    Notify(Notice),
    Fail(EngineError),
}

impl Command {
    #[must_use]
    pub fn remote(tag: ReplyTag, call: RemoteCall) -> Self {
        Self::Remote { tag, call }
    }

    /// Remote call whose reply only needs its failures logged.
    #[must_use]
    pub fn fire(call: RemoteCall) -> Self {
        let what = call.name().to_owned();
        Self::Remote {
            tag: ReplyTag::Fire { what },
            call,
        }
    }
}
