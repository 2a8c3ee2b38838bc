//! Push notifications from the chat service.
//!
//! The set of kinds is closed. [`Engine::on_notification`] routes each variant
//! to exactly one handler; adding a variant fails the build until it is
//! handled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::command::Command;
use crate::engine::Engine;
use crate::error::RemoteErrorClass;
use crate::ids::{ConversationIdKey, MessageId, OutboxId, Username};
use crate::message::{Reactions, RemoteMessage, ThreadPage};
use crate::meta::ConversationMeta;
use crate::paginator::LoadId;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct IncrementalItem {
    pub meta: ConversationMeta,
    #[serde(default)]
    pub should_unbox: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "sync", rename_all = "snake_case")]
pub enum InboxSync {
    Clear,
    Current,
    Incremental { items: Vec<IncrementalItem> },
    /// Anything the service reports that this client does not understand.
    #[serde(other)]
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleUpdateKind {
    /// Only the conversation's metadata changed.
    ConvUpdate,
    NewActivity,
    Clear,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StaleUpdate {
    pub conversation: ConversationIdKey,
    pub kind: StaleUpdateKind,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "mutation", rename_all = "snake_case")]
pub enum MessageMutation {
    Edit {
        target: MessageId,
        text: String,
    },
    Delete {
        targets: Vec<MessageId>,
        #[serde(default)]
        by: Option<Username>,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ReactionUpdate {
    pub target: MessageId,
    pub reactions: Reactions,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FailedRecord {
    pub conversation: ConversationIdKey,
    pub outbox_id: OutboxId,
    pub reason: String,
    pub class: RemoteErrorClass,
    /// Set for identify failures.
    #[serde(default)]
    pub username: Option<Username>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TypingState {
    pub conversation: ConversationIdKey,
    pub typers: BTreeSet<Username>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    InboxSynced(InboxSync),
    InboxStale,
    JoinedConversation,
    LeftConversation {
        conversation: ConversationIdKey,
    },
    TeamTypeChanged {
        conversation: ConversationIdKey,
    },
    ThreadsStale {
        updates: Vec<StaleUpdate>,
    },
    SubteamRename {
        conversations: Vec<ConversationIdKey>,
    },
    MembersUpdate {
        conversation: ConversationIdKey,
    },
    SetConvRetention {
        conversation: ConversationIdKey,
        #[serde(default)]
        meta: Option<ConversationMeta>,
    },
    SetTeamRetention {
        metas: Vec<ConversationMeta>,
    },
    TlfFinalize {
        conversation: ConversationIdKey,
    },
    IncomingMessage {
        conversation: ConversationIdKey,
        #[serde(default)]
        message: Option<RemoteMessage>,
        #[serde(default)]
        mutation: Option<MessageMutation>,
        #[serde(default)]
        meta: Option<ConversationMeta>,
    },
    MessagesUpdated {
        conversation: ConversationIdKey,
        messages: Vec<RemoteMessage>,
    },
    EphemeralPurge {
        conversation: ConversationIdKey,
        ids: Vec<MessageId>,
    },
    Expunge {
        conversation: ConversationIdKey,
        upto: MessageId,
        #[serde(default)]
        meta: Option<ConversationMeta>,
    },
    ReactionUpdate {
        conversation: ConversationIdKey,
        updates: Vec<ReactionUpdate>,
    },
    FailedMessage {
        records: Vec<FailedRecord>,
    },
    ReadyToSend {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    PostConfirmRequired {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    AttachmentUploadStart {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    AttachmentUploadProgress {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
        bytes_complete: u64,
        bytes_total: u64,
    },
    /// An early page of a thread load, served from the service's cache.
    ThreadCached {
        load_id: LoadId,
        page: ThreadPage,
    },
    TypingUpdate {
        conversations: Vec<TypingState>,
    },
    IdentifyUpdate {
        #[serde(default)]
        broken: BTreeSet<Username>,
        #[serde(default)]
        fixed: BTreeSet<Username>,
    },
    SetAppNotificationSettings {
        settings: BTreeMap<String, bool>,
    },
    SetConvSettings {
        conversation: ConversationIdKey,
        #[serde(default)]
        min_writer_role: Option<String>,
    },
}

impl Notification {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::InboxSynced(_) => "inbox_synced",
            Self::InboxStale => "inbox_stale",
            Self::JoinedConversation => "joined_conversation",
            Self::LeftConversation { .. } => "left_conversation",
            Self::TeamTypeChanged { .. } => "team_type_changed",
            Self::ThreadsStale { .. } => "threads_stale",
            Self::SubteamRename { .. } => "subteam_rename",
            Self::MembersUpdate { .. } => "members_update",
            Self::SetConvRetention { .. } => "set_conv_retention",
            Self::SetTeamRetention { .. } => "set_team_retention",
            Self::TlfFinalize { .. } => "tlf_finalize",
            Self::IncomingMessage { .. } => "incoming_message",
            Self::MessagesUpdated { .. } => "messages_updated",
            Self::EphemeralPurge { .. } => "ephemeral_purge",
            Self::Expunge { .. } => "expunge",
            Self::ReactionUpdate { .. } => "reaction_update",
            Self::FailedMessage { .. } => "failed_message",
            Self::ReadyToSend { .. } => "ready_to_send",
            Self::PostConfirmRequired { .. } => "post_confirm_required",
            Self::AttachmentUploadStart { .. } => "attachment_upload_start",
            Self::AttachmentUploadProgress { .. } => "attachment_upload_progress",
            Self::ThreadCached { .. } => "thread_cached",
            Self::TypingUpdate { .. } => "typing_update",
            Self::IdentifyUpdate { .. } => "identify_update",
            Self::SetAppNotificationSettings { .. } => "set_app_notification_settings",
            Self::SetConvSettings { .. } => "set_conv_settings",
        }
    }
}

impl Engine {
    pub(crate) fn on_notification(&mut self, notification: Notification) -> Vec<Command> {
        debug!(kind = notification.name(), "notification");
        match notification {
            Notification::InboxSynced(sync) => self.on_inbox_synced(sync),
            Notification::InboxStale => self.on_inbox_stale(),
            Notification::JoinedConversation => self.on_joined_conversation(),
            Notification::LeftConversation { conversation } => {
                self.on_left_conversation(&conversation)
            }
            Notification::TeamTypeChanged { conversation } => {
                self.on_team_type_changed(&conversation)
            }
            Notification::ThreadsStale { updates } => self.on_threads_stale(updates),
            Notification::SubteamRename { conversations } => self.on_subteam_rename(&conversations),
            Notification::MembersUpdate { conversation } => self.on_members_update(&conversation),
            Notification::SetConvRetention { conversation, meta } => {
                self.on_set_conv_retention(&conversation, meta)
            }
            Notification::SetTeamRetention { metas } => self.on_set_team_retention(metas),
            Notification::TlfFinalize { conversation } => self.on_tlf_finalize(&conversation),
            Notification::IncomingMessage {
                conversation,
                message,
                mutation,
                meta,
            } => self.on_incoming_message(&conversation, message, mutation, meta),
            Notification::MessagesUpdated {
                conversation,
                messages,
            } => self.on_messages_updated(&conversation, messages),
            Notification::EphemeralPurge { conversation, ids } => {
                self.on_ephemeral_purge(&conversation, &ids)
            }
            Notification::Expunge {
                conversation,
                upto,
                meta,
            } => self.on_expunge(&conversation, upto, meta),
            Notification::ReactionUpdate {
                conversation,
                updates,
            } => self.on_reaction_update(&conversation, updates),
            Notification::FailedMessage { records } => self.on_failed_message(records),
            Notification::ReadyToSend {
                conversation,
                outbox_id,
            } => self.on_ready_to_send(&conversation, &outbox_id),
            Notification::PostConfirmRequired {
                conversation,
                outbox_id,
            } => self.on_post_confirm_required(&conversation, outbox_id),
            Notification::AttachmentUploadStart {
                conversation,
                outbox_id,
            } => self.on_upload_start(&conversation, &outbox_id),
            Notification::AttachmentUploadProgress {
                conversation,
                outbox_id,
                bytes_complete,
                bytes_total,
            } => self.on_upload_progress(&conversation, &outbox_id, bytes_complete, bytes_total),
            Notification::ThreadCached { load_id, page } => self.on_thread_cached(load_id, page),
            Notification::TypingUpdate { conversations } => self.on_typing_update(conversations),
            Notification::IdentifyUpdate { broken, fixed } => self.on_identify_update(broken, &fixed),
            Notification::SetAppNotificationSettings { settings } => {
                self.app_notification_settings = settings;
                vec![Command::Render]
            }
            Notification::SetConvSettings {
                conversation,
                min_writer_role,
            } => self.on_set_conv_settings(&conversation, min_writer_role),
        }
    }
}
