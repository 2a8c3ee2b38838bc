use crux_core::capability::{Capability, CapabilityContext, Operation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::RemoteError;
use crate::ids::{ConversationIdKey, MessageId, OutboxId, TeamName, Username};
use crate::message::{EditTarget, ThreadPage};
use crate::meta::{ConversationMeta, RetentionPolicy};
use crate::paginator::LoadReason;

/// Every request the engine makes of the chat service. The shell owns the
/// transport and answers each with a [`RemoteResult`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum RemoteCall {
    GetInboxUntrusted,
    GetInboxTrusted {
        conversations: Vec<ConversationIdKey>,
        force: bool,
    },
    GetThread {
        conversation: ConversationIdKey,
        count: u32,
        continuation: Option<String>,
        reason: LoadReason,
    },
    PostText {
        conversation: ConversationIdKey,
        tlf_name: String,
        outbox_id: OutboxId,
        text: String,
        exploding_lifetime_secs: Option<u64>,
    },
    PostEdit {
        conversation: ConversationIdKey,
        tlf_name: String,
        outbox_id: OutboxId,
        target: EditTarget,
        text: String,
    },
    PostDelete {
        conversation: ConversationIdKey,
        tlf_name: String,
        outbox_id: OutboxId,
        target: MessageId,
    },
    CancelPost {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    RetryPost {
        conversation: ConversationIdKey,
        outbox_id: OutboxId,
    },
    ToggleReaction {
        conversation: ConversationIdKey,
        tlf_name: String,
        outbox_id: OutboxId,
        target: MessageId,
        emoji: String,
    },
    AttachmentPlaceholder {
        conversation: ConversationIdKey,
        tlf_name: String,
    },
    AttachmentPreview {
        file_path: String,
    },
    AttachmentUpload {
        conversation: ConversationIdKey,
        tlf_name: String,
        outbox_id: OutboxId,
        file_path: String,
        title: String,
        exploding_lifetime_secs: Option<u64>,
    },
    AnswerConfirm {
        outbox_id: OutboxId,
        accept: bool,
    },
    FindExisting {
        tlf_name: String,
        participants: BTreeSet<Username>,
    },
    FindTeamChannel {
        team: TeamName,
        channel: String,
    },
    PreviewConversation {
        conversation: ConversationIdKey,
    },
    CreateConversation {
        tlf_name: String,
        participants: BTreeSet<Username>,
    },
    JoinConversation {
        conversation: ConversationIdKey,
    },
    LeaveConversation {
        conversation: ConversationIdKey,
    },
    LeaveTeam {
        team: TeamName,
    },
    BlockConversation {
        conversation: ConversationIdKey,
        report: bool,
    },
    MuteConversation {
        conversation: ConversationIdKey,
        muted: bool,
    },
    SetRetention {
        conversation: ConversationIdKey,
        policy: RetentionPolicy,
    },
    DeleteHistory {
        conversation: ConversationIdKey,
        tlf_name: String,
        upto: MessageId,
    },
    MarkRead {
        conversation: ConversationIdKey,
        message_id: MessageId,
    },
    SetExplodingMode {
        conversation: ConversationIdKey,
        seconds: u64,
    },
    SendTyping {
        conversation: ConversationIdKey,
        typing: bool,
    },
}

impl RemoteCall {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GetInboxUntrusted => "get_inbox_untrusted",
            Self::GetInboxTrusted { .. } => "get_inbox_trusted",
            Self::GetThread { .. } => "get_thread",
            Self::PostText { .. } => "post_text",
            Self::PostEdit { .. } => "post_edit",
            Self::PostDelete { .. } => "post_delete",
            Self::CancelPost { .. } => "cancel_post",
            Self::RetryPost { .. } => "retry_post",
            Self::ToggleReaction { .. } => "toggle_reaction",
            Self::AttachmentPlaceholder { .. } => "attachment_placeholder",
            Self::AttachmentPreview { .. } => "attachment_preview",
            Self::AttachmentUpload { .. } => "attachment_upload",
            Self::AnswerConfirm { .. } => "answer_confirm",
            Self::FindExisting { .. } => "find_existing",
            Self::FindTeamChannel { .. } => "find_team_channel",
            Self::PreviewConversation { .. } => "preview_conversation",
            Self::CreateConversation { .. } => "create_conversation",
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::LeaveTeam { .. } => "leave_team",
            Self::BlockConversation { .. } => "block_conversation",
            Self::MuteConversation { .. } => "mute_conversation",
            Self::SetRetention { .. } => "set_retention",
            Self::DeleteHistory { .. } => "delete_history",
            Self::MarkRead { .. } => "mark_read",
            Self::SetExplodingMode { .. } => "set_exploding_mode",
            Self::SendTyping { .. } => "send_typing",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UnboxFailure {
    pub conversation: ConversationIdKey,
    pub message: String,
    #[serde(default)]
    pub transient: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum RemoteReply {
    Ack,
    Inbox {
        conversations: Vec<ConversationMeta>,
    },
    Unboxed {
        conversations: Vec<ConversationMeta>,
        #[serde(default)]
        failures: Vec<UnboxFailure>,
    },
    Thread(ThreadPage),
    Posted {
        message_id: MessageId,
    },
    Placeholder {
        outbox_id: OutboxId,
    },
    Preview {
        preview_url: Option<String>,
    },
    Found {
        conversations: Vec<ConversationMeta>,
    },
    Created {
        conversation: ConversationMeta,
    },
}

pub type RemoteResult = Result<RemoteReply, RemoteError>;

impl Operation for RemoteCall {
    type Output = RemoteResult;
}

pub struct ChatRpc<E> {
    context: CapabilityContext<RemoteCall, E>,
}

impl<Ev> Capability<Ev> for ChatRpc<Ev> {
    type Operation = RemoteCall;
    type MappedSelf<MappedEv> = ChatRpc<MappedEv>;

    fn map_event<F, NewEv>(&self, f: F) -> Self::MappedSelf<NewEv>
    where
        F: Fn(NewEv) -> Ev + Send + Sync + 'static,
        Ev: 'static,
        NewEv: 'static + Send,
    {
        ChatRpc::new(self.context.map_event(f))
    }
}

impl<E> ChatRpc<E>
where
    E: 'static,
{
    pub fn new(context: CapabilityContext<RemoteCall, E>) -> Self {
        Self { context }
    }

    /// Sends `call` to the shell and feeds its result back through `callback`.
    pub fn call<F>(&self, call: RemoteCall, callback: F)
    where
        F: FnOnce(RemoteResult) -> E + Send + 'static,
    {
        let context = self.context.clone();
        self.context.spawn(async move {
            let result = context.request_from_shell(call).await;
            context.update_app(callback(result));
        });
    }
}
