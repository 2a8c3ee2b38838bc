//! The sync engine: a reducer from events to follow-up commands.
//!
//! All state lives here and is mutated only by [`Engine::handle`]. Remote
//! work leaves as [`Command::Remote`] and its reply comes back as
//! [`EngineEvent::RemoteSettled`], so every handler runs to completion before
//! the next event is looked at.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info, warn};

use crate::capabilities::{RemoteCall, RemoteReply, RemoteResult};
use crate::command::{Command, ReplyTag};
use crate::config::EngineConfig;
use crate::error::{EngineError, Notice};
use crate::ids::{ConversationIdKey, TeamName, Username};
use crate::inbox::RefreshReason;
use crate::message::MessageStore;
use crate::meta::{MetaSource, MetaStore, RetentionPolicy};
use crate::notification::Notification;
use crate::ordinal::Ordinal;
use crate::paginator::{LoadReason, ThreadPaginator};
use crate::pending::{CreateOutcome, FindOutcome, PendingConversationResolver};
use crate::selection;
use crate::send::{AttachmentSpec, SendContext, SendPipeline};
use crate::unbox_queue::MetaUnboxQueue;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    SetUser {
        username: Option<Username>,
    },
    RefreshInbox {
        reason: RefreshReason,
    },
    /// Conversations became visible; untrusted ones join the unbox queue.
    QueueMetas {
        conversations: Vec<ConversationIdKey>,
    },
    DrainUnboxQueue,
    RequestTrustedMeta {
        conversations: Vec<ConversationIdKey>,
        force: bool,
    },
    SelectConversation {
        conversation: ConversationIdKey,
    },
    LoadOlderMessages,
    SendText {
        text: String,
    },
    EditMessage {
        ordinal: Ordinal,
        text: String,
    },
    SetEditing {
        ordinal: Option<Ordinal>,
    },
    DeleteMessage {
        ordinal: Ordinal,
    },
    RetryMessage {
        ordinal: Ordinal,
    },
    ToggleReaction {
        ordinal: Ordinal,
        emoji: String,
    },
    UploadAttachments {
        files: Vec<AttachmentSpec>,
    },
    ComposeWithUsers {
        users: BTreeSet<Username>,
        #[serde(default)]
        from_reset: bool,
    },
    StartTeamBuilding,
    ComposeTeamChannel {
        team: TeamName,
        channel: String,
    },
    CancelCompose,
    CreateConversation,
    ConfirmPost {
        accept: bool,
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
    },
    MarkRead,
    SetExplodingMode {
        conversation: ConversationIdKey,
        seconds: u64,
    },
    SendTyping {
        typing: bool,
    },
    DismissNotice,
    Notification(Notification),
    RemoteSettled {
        tag: ReplyTag,
        result: RemoteResult,
    },
}

#[derive(Debug)]
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) metas: MetaStore,
    pub(crate) messages: MessageStore,
    pub(crate) unbox_queue: MetaUnboxQueue,
    pub(crate) paginator: ThreadPaginator,
    pub(crate) sender: SendPipeline,
    pub(crate) pending: PendingConversationResolver,
    pub(crate) selected: ConversationIdKey,
    pub(crate) editing: Option<Ordinal>,
    pub(crate) stale: HashSet<ConversationIdKey>,
    pub(crate) typers: HashMap<ConversationIdKey, BTreeSet<Username>>,
    pub(crate) broken_users: BTreeSet<Username>,
    pub(crate) app_notification_settings: BTreeMap<String, bool>,
    pub(crate) notice: Option<Notice>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            metas: MetaStore::new(),
            messages: MessageStore::new(),
            unbox_queue: MetaUnboxQueue::new(&config),
            paginator: ThreadPaginator::new(&config),
            sender: SendPipeline::new(config.resolved_outbox_memory, config.upload_progress_step),
            pending: PendingConversationResolver::new(),
            selected: ConversationIdKey::NoConversation,
            editing: None,
            stale: HashSet::new(),
            typers: HashMap::new(),
            broken_users: BTreeSet::new(),
            app_notification_settings: BTreeMap::new(),
            notice: None,
            config,
        }
    }

    /// Applies a new config. Tunables take effect immediately; stored state
    /// is kept.
    pub fn reconfigure(&mut self, config: EngineConfig) {
        info!(user = ?config.username, "engine reconfigured");
        self.unbox_queue.reconfigure(&config);
        self.paginator.reconfigure(&config);
        self.sender.set_progress_step(config.upload_progress_step);
        self.sender.set_resolved_memory(config.resolved_outbox_memory);
        self.config = config;
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn selected(&self) -> &ConversationIdKey {
        &self.selected
    }

    #[must_use]
    pub const fn metas(&self) -> &MetaStore {
        &self.metas
    }

    #[must_use]
    pub const fn messages(&self) -> &MessageStore {
        &self.messages
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingConversationResolver {
        &self.pending
    }

    #[must_use]
    pub const fn sender(&self) -> &SendPipeline {
        &self.sender
    }

    #[must_use]
    pub const fn unbox_queue(&self) -> &MetaUnboxQueue {
        &self.unbox_queue
    }

    #[must_use]
    pub const fn paginator(&self) -> &ThreadPaginator {
        &self.paginator
    }

    #[must_use]
    pub const fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    #[must_use]
    pub const fn editing(&self) -> Option<Ordinal> {
        self.editing
    }

    #[must_use]
    pub const fn broken_users(&self) -> &BTreeSet<Username> {
        &self.broken_users
    }

    #[must_use]
    pub fn typers(&self, conversation: &ConversationIdKey) -> Option<&BTreeSet<Username>> {
        self.typers.get(conversation)
    }

    #[must_use]
    pub fn is_stale(&self, conversation: &ConversationIdKey) -> bool {
        self.stale.contains(conversation)
    }

    #[must_use]
    pub const fn app_notification_settings(&self) -> &BTreeMap<String, bool> {
        &self.app_notification_settings
    }

    /// The key the selected thread's messages live under. A pending
    /// composition shows its resolved target once there is one.
    #[must_use]
    pub fn thread_key(&self) -> ConversationIdKey {
        match self.pending.effective_identity(&self.selected) {
            id if id.is_valid() => id,
            _ if self.selected.is_pending() => ConversationIdKey::Pending,
            _ => self.selected.clone(),
        }
    }

    /// Handles one event. Service contract violations become a notice and an
    /// error log; the returned commands are for the host to run.
    pub fn handle(&mut self, event: EngineEvent) -> Vec<Command> {
        let mut out = Vec::new();
        for command in self.dispatch(event) {
            match command {
                Command::Fail(e) => {
                    error!(error = %e, severity = ?e.severity(), "engine error");
                    self.notice = Some(Notice::from_engine_error(&e));
                    out.push(Command::Render);
                }
                Command::Notify(notice) => {
                    self.notice = Some(notice);
                    out.push(Command::Render);
                }
                other => out.push(other),
            }
        }
        out
    }

    /// Like [`Self::handle`], but hands the first contract violation back to
    /// the caller instead of turning it into a notice.
    pub fn try_handle(&mut self, event: EngineEvent) -> Result<Vec<Command>, EngineError> {
        let commands = self.dispatch(event);
        if let Some(e) = commands.iter().find_map(|c| match c {
            Command::Fail(e) => Some(e.clone()),
            _ => None,
        }) {
            return Err(e);
        }
        Ok(commands
            .into_iter()
            .map(|c| match c {
                Command::Notify(notice) => {
                    self.notice = Some(notice);
                    Command::Render
                }
                other => other,
            })
            .collect())
    }

    fn dispatch(&mut self, event: EngineEvent) -> Vec<Command> {
        match event {
            EngineEvent::SetUser { username } => self.set_user(username),
            EngineEvent::RefreshInbox { reason } => self.refresh_inbox(reason),
            EngineEvent::QueueMetas { conversations } => self.queue_metas(conversations),
            EngineEvent::DrainUnboxQueue => self.drain_unbox_queue(),
            EngineEvent::RequestTrustedMeta {
                conversations,
                force,
            } => self.request_trusted(&conversations, force),
            EngineEvent::SelectConversation { conversation } => self.select(conversation),
            EngineEvent::LoadOlderMessages => {
                self.load_thread(LoadReason::Scrollback, true)
            }
            EngineEvent::SendText { text } => self.send_text(&text),
            EngineEvent::EditMessage { ordinal, text } => {
                self.editing = None;
                let key = self.thread_key();
                self.as_user(|sender, ctx| sender.edit(ctx, &key, ordinal, &text))
            }
            EngineEvent::SetEditing { ordinal } => {
                self.editing = ordinal;
                vec![Command::Render]
            }
            EngineEvent::DeleteMessage { ordinal } => {
                let key = self.thread_key();
                self.as_user(|sender, ctx| sender.delete(ctx, &key, ordinal))
            }
            EngineEvent::RetryMessage { ordinal } => {
                let key = self.thread_key();
                self.as_user(|sender, ctx| sender.retry(ctx, &key, ordinal))
            }
            EngineEvent::ToggleReaction { ordinal, emoji } => {
                let key = self.thread_key();
                self.as_user(|sender, ctx| sender.toggle_reaction(ctx, &key, ordinal, &emoji))
            }
            EngineEvent::UploadAttachments { files } => self.upload_attachments(files),
            EngineEvent::ComposeWithUsers { users, from_reset } => {
                self.compose_with_users(users, from_reset)
            }
            EngineEvent::StartTeamBuilding => {
                self.pending.begin_team_building();
                vec![Command::Render]
            }
            EngineEvent::ComposeTeamChannel { team, channel } => {
                self.compose_team_channel(team, channel)
            }
            EngineEvent::CancelCompose => self.cancel_compose(),
            EngineEvent::CreateConversation => self.create_conversation(),
            EngineEvent::ConfirmPost { accept } => {
                self.with_sender(|sender, ctx| sender.confirm(ctx, accept))
            }
            EngineEvent::JoinConversation { conversation } => self.join(&conversation),
            EngineEvent::LeaveConversation { conversation } => self.leave(&conversation),
            EngineEvent::LeaveTeam { team } => self.leave_team(team),
            EngineEvent::BlockConversation {
                conversation,
                report,
            } => self.block(&conversation, report),
            EngineEvent::MuteConversation {
                conversation,
                muted,
            } => self.mute(&conversation, muted),
            EngineEvent::SetRetention {
                conversation,
                policy,
            } => self.set_retention(&conversation, policy),
            EngineEvent::DeleteHistory { conversation } => self.delete_history(&conversation),
            EngineEvent::MarkRead => self.mark_read(),
            EngineEvent::SetExplodingMode {
                conversation,
                seconds,
            } => self.set_exploding_mode(&conversation, seconds),
            EngineEvent::SendTyping { typing } => self.send_typing(typing),
            EngineEvent::DismissNotice => {
                self.notice = None;
                vec![Command::Render]
            }
            EngineEvent::Notification(notification) => self.on_notification(notification),
            EngineEvent::RemoteSettled { tag, result } => self.on_remote_settled(tag, result),
        }
    }

    /// Runs a send-pipeline operation against the engine's stores.
    pub(crate) fn with_sender<R>(
        &mut self,
        f: impl FnOnce(&mut SendPipeline, &mut SendContext<'_>) -> R,
    ) -> R {
        let fallback = Username::new("");
        let you = self.config.username.as_ref().unwrap_or(&fallback);
        let mut ctx = SendContext {
            messages: &mut self.messages,
            metas: &self.metas,
            you,
        };
        f(&mut self.sender, &mut ctx)
    }

    /// Runs a user-initiated send operation; nobody signed in is a contract
    /// error.
    fn as_user(
        &mut self,
        f: impl FnOnce(&mut SendPipeline, &mut SendContext<'_>) -> Vec<Command>,
    ) -> Vec<Command> {
        if self.config.username.is_none() {
            return vec![Command::Fail(EngineError::NotLoggedIn)];
        }
        self.with_sender(f)
    }

    fn set_user(&mut self, username: Option<Username>) -> Vec<Command> {
        if self.config.username == username {
            return vec![];
        }
        info!(user = ?username, "user changed, clearing engine state");
        let config = EngineConfig {
            username,
            ..self.config.clone()
        };
        *self = Self::new(config);
        if self.config.username.is_some() {
            let mut commands = self.refresh_inbox(RefreshReason::Bootstrapping);
            commands.push(Command::Render);
            commands
        } else {
            vec![Command::Render]
        }
    }

    pub(crate) fn select(&mut self, conversation: ConversationIdKey) -> Vec<Command> {
        if conversation == self.selected && !self.stale.contains(&conversation) {
            return vec![];
        }
        debug!(conversation = %conversation, "selecting conversation");
        self.pending.on_select(&conversation);
        if !conversation.is_pending() && self.selected.is_pending() && !self.pending.is_active() {
            self.with_sender(SendPipeline::discard_held);
        }
        self.selected = conversation;
        self.editing = None;
        let mut commands = vec![Command::Render];
        commands.extend(self.load_thread(LoadReason::Selected, false));
        commands
    }

    /// Loads the selected thread, mapping a pending composition onto its
    /// resolved target.
    pub(crate) fn load_thread(&mut self, reason: LoadReason, scrollback: bool) -> Vec<Command> {
        let identity = self.selected.clone();
        self.load_conversation(&identity, reason, scrollback)
    }

    pub(crate) fn load_conversation(
        &mut self,
        identity: &ConversationIdKey,
        reason: LoadReason,
        scrollback: bool,
    ) -> Vec<Command> {
        let target = self.pending.resolved().cloned();
        let effective = if identity.is_pending() {
            target.clone().unwrap_or(ConversationIdKey::Pending)
        } else {
            identity.clone()
        };
        let meta = self.metas.get(&effective);
        let Some(request) =
            self.paginator
                .request_load(identity, target.as_ref(), meta, reason, scrollback)
        else {
            return vec![];
        };
        if !scrollback {
            self.stale.remove(&request.conversation);
        }
        vec![Command::remote(
            ReplyTag::Thread {
                load_id: request.load_id,
            },
            RemoteCall::GetThread {
                conversation: request.conversation,
                count: request.count,
                continuation: request.continuation,
                reason: request.reason,
            },
        )]
    }

    fn send_text(&mut self, text: &str) -> Vec<Command> {
        if self.config.username.is_none() {
            return vec![Command::Fail(EngineError::NotLoggedIn)];
        }
        if !self.selected.is_pending() {
            let key = self.selected.clone();
            return self.with_sender(|sender, ctx| sender.send_text(ctx, &key, text));
        }

        let identity = self.pending.effective_identity(&self.selected);
        if identity.is_valid() {
            // The composition resolved to an existing conversation: the send
            // goes there and the composition is done.
            self.pending.clear();
            self.selected = identity.clone();
            let mut commands =
                self.with_sender(|sender, ctx| sender.send_text(ctx, &identity, text));
            commands.extend(self.load_thread(LoadReason::Selected, false));
            return commands;
        }

        let mut commands =
            self.with_sender(|sender, ctx| sender.send_text(ctx, &ConversationIdKey::Pending, text));
        if self.pending.needs_creation() {
            commands.extend(self.create_conversation());
        }
        commands
    }

    fn upload_attachments(&mut self, files: Vec<AttachmentSpec>) -> Vec<Command> {
        let identity = self.pending.effective_identity(&self.selected);
        let mut commands = self.with_sender(|sender, ctx| sender.upload_attachments(ctx, &identity, files));
        if identity.is_pending() && self.pending.needs_creation() {
            commands.extend(self.create_conversation());
        }
        commands
    }

    fn compose_with_users(&mut self, users: BTreeSet<Username>, from_reset: bool) -> Vec<Command> {
        let Some(you) = self.config.username.clone() else {
            return vec![Command::Fail(EngineError::NotLoggedIn)];
        };
        let users: BTreeSet<Username> = users.into_iter().filter(|u| u != &you).collect();
        if !self.selected.is_pending() {
            self.with_sender(SendPipeline::discard_held);
        }
        self.selected = ConversationIdKey::Pending;
        self.editing = None;
        self.pending.compose_users(users, from_reset, &you)
    }

    fn compose_team_channel(&mut self, team: TeamName, channel: String) -> Vec<Command> {
        self.pending.clear();
        self.with_sender(SendPipeline::discard_held);
        info!(team = %team, channel = %channel, "looking up team channel");
        vec![Command::remote(
            ReplyTag::FindTeamChannel {
                team: team.clone(),
                channel: channel.clone(),
            },
            RemoteCall::FindTeamChannel { team, channel },
        )]
    }

    fn cancel_compose(&mut self) -> Vec<Command> {
        self.pending.clear();
        self.with_sender(SendPipeline::discard_held);
        if self.selected.is_pending() {
            self.selected = selection::newest_eligible(&self.metas, None);
            let mut commands = vec![Command::Render];
            commands.extend(self.load_thread(LoadReason::Selected, false));
            return commands;
        }
        vec![Command::Render]
    }

    fn create_conversation(&mut self) -> Vec<Command> {
        let Some(you) = self.config.username.clone() else {
            return vec![Command::Fail(EngineError::NotLoggedIn)];
        };
        let mut commands = vec![Command::Render];
        commands.extend(self.pending.create_conversation(&you));
        commands
    }

    fn on_remote_settled(&mut self, tag: ReplyTag, result: RemoteResult) -> Vec<Command> {
        match tag {
            ReplyTag::Inbox { reason } => self.on_inbox_reply(reason, result),
            ReplyTag::Unbox { conversations } => self.on_unbox_reply(&conversations, result),
            ReplyTag::Thread { load_id } => self.on_thread_reply(load_id, result),
            ReplyTag::Post {
                conversation,
                outbox_id,
            } => self.with_sender(|sender, ctx| {
                sender.on_post_reply(ctx, &conversation, &outbox_id, result)
            }),
            ReplyTag::Edit {
                conversation,
                outbox_id,
                target,
                text,
            } => self.with_sender(|sender, ctx| {
                sender.on_edit_reply(ctx, &conversation, &outbox_id, &target, &text, result)
            }),
            ReplyTag::Delete {
                conversation,
                outbox_id,
                target,
            } => self.with_sender(|sender, ctx| {
                sender.on_delete_reply(ctx, &conversation, &outbox_id, target, result)
            }),
            ReplyTag::Reaction {
                conversation,
                target,
                emoji,
                ..
            } => self.with_sender(|sender, ctx| {
                sender.on_reaction_reply(ctx, &conversation, target, &emoji, result)
            }),
            ReplyTag::Placeholder { batch } => self.sender.on_placeholder_reply(batch, result),
            ReplyTag::Preview { batch } => {
                self.with_sender(|sender, ctx| sender.on_preview_reply(ctx, batch, result))
            }
            ReplyTag::Upload {
                batch,
                conversation,
                outbox_id,
            } => self.with_sender(|sender, ctx| {
                sender.on_upload_reply(ctx, batch, &conversation, &outbox_id, result)
            }),
            ReplyTag::FindExisting { participants } => self.on_find_existing(&participants, result),
            ReplyTag::FindTeamChannel { team, channel } => {
                self.on_find_team_channel(team, channel, result)
            }
            ReplyTag::Create { participants } => self.on_created(&participants, result),
            ReplyTag::Leave {
                conversation,
                avoid_team,
            } => self.on_left(&conversation, avoid_team.as_ref(), result),
            ReplyTag::Block { conversation } => self.on_left(&conversation, None, result),
            ReplyTag::ExplodingMode {
                conversation,
                seconds,
            } => self.on_exploding_mode_reply(&conversation, seconds, result),
            ReplyTag::Fire { what } => match result {
                Ok(_) => vec![],
                Err(e) if e.is_transient() => {
                    warn!(what, error = %e, "transient failure");
                    vec![]
                }
                Err(e) => {
                    error!(what, error = %e, "request rejected");
                    vec![Command::Notify(Notice::fatal(e.user_facing_message()))]
                }
            },
        }
    }

    fn on_find_existing(&mut self, participants: &BTreeSet<Username>, result: RemoteResult) -> Vec<Command> {
        match self.pending.on_find_existing(participants, result) {
            FindOutcome::Stale => vec![],
            FindOutcome::Found(meta) => {
                let id = meta.id.clone();
                self.metas.receive(vec![meta], MetaSource::Trusted);
                let mut commands = vec![Command::Render];
                if self.sender.has_held() {
                    self.pending.clear();
                    self.selected = id.clone();
                    commands.extend(self.with_sender(|sender, ctx| sender.flush_held(ctx, &id)));
                }
                commands.extend(self.load_thread(LoadReason::Selected, false));
                commands
            }
            FindOutcome::NotFound => {
                let mut commands = vec![Command::Render];
                if self.sender.has_held() {
                    commands.extend(self.create_conversation());
                }
                commands
            }
            FindOutcome::Failed(e) => {
                let mut commands = if e.is_transient() {
                    warn!(error = %e, "find-existing failed");
                    vec![Command::Render]
                } else {
                    error!(error = %e, "find-existing rejected");
                    vec![Command::Notify(Notice::fatal(e.user_facing_message()))]
                };
                // Held sends either go to a new conversation or fail visibly.
                if let Some(user) = e.identify_failed_user() {
                    self.broken_users.insert(Username::new(user));
                    let reason = e.user_facing_message();
                    self.with_sender(|sender, ctx| sender.fail_held(ctx, &reason));
                    commands.push(Command::Render);
                } else if self.sender.has_held() {
                    commands.extend(self.create_conversation());
                }
                commands
            }
        }
    }

    fn on_find_team_channel(&mut self, team: TeamName, channel: String, result: RemoteResult) -> Vec<Command> {
        let found = match result {
            Ok(RemoteReply::Found { conversations }) => conversations
                .into_iter()
                .find(|m| m.id.is_valid() && m.channel_name.as_deref() == Some(channel.as_str())),
            Ok(_) => None,
            Err(e) if e.is_transient() => {
                warn!(team = %team, error = %e, "team channel lookup failed");
                return vec![];
            }
            Err(e) => return vec![Command::Notify(Notice::fatal(e.user_facing_message()))],
        };
        let Some(meta) = found else {
            return vec![Command::Fail(EngineError::NonExistentChannel { team, channel })];
        };
        let id = meta.id.clone();
        self.metas.receive(vec![meta], MetaSource::Trusted);
        let mut commands = vec![Command::fire(RemoteCall::PreviewConversation {
            conversation: id.clone(),
        })];
        commands.extend(self.select(id));
        commands
    }

    fn on_created(&mut self, participants: &BTreeSet<Username>, result: RemoteResult) -> Vec<Command> {
        match self.pending.on_created(participants, result) {
            CreateOutcome::Created(meta) => {
                let id = meta.id.clone();
                info!(conversation = %id, "conversation created");
                self.metas.receive(vec![meta], MetaSource::Trusted);
                let was_pending = self.selected.is_pending();
                let mut commands = self.with_sender(|sender, ctx| sender.flush_held(ctx, &id));
                if was_pending {
                    self.selected = id.clone();
                    commands.extend(self.load_conversation(&id, LoadReason::Created, false));
                }
                commands
            }
            CreateOutcome::Orphaned(meta) => {
                debug!(conversation = %meta.id, "conversation created for an abandoned composition");
                self.metas.receive(vec![meta], MetaSource::Trusted);
                vec![Command::Render]
            }
            CreateOutcome::Failed(e) => {
                if let Some(user) = e.identify_failed_user() {
                    self.broken_users.insert(Username::new(user));
                }
                let reason = e.user_facing_message();
                self.with_sender(|sender, ctx| sender.fail_held(ctx, &reason));
                if e.is_transient() {
                    warn!(error = %e, "conversation creation failed");
                    vec![Command::Render]
                } else {
                    error!(error = %e, "conversation creation rejected");
                    vec![Command::Notify(Notice::fatal(reason))]
                }
            }
            CreateOutcome::InvalidIdentity(id) => {
                self.with_sender(|sender, ctx| sender.fail_held(ctx, "conversation could not be created"));
                vec![Command::Fail(EngineError::InvalidIdentity(id))]
            }
            CreateOutcome::Malformed => {
                self.with_sender(|sender, ctx| sender.fail_held(ctx, "conversation could not be created"));
                vec![Command::Fail(EngineError::MissingRemoteData {
                    what: "created conversation",
                })]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::RemoteReply;
    use crate::ids::MessageId;
    use crate::message::{MessageBody, Pagination, RemoteMessage, ThreadPage};
    use crate::meta::ConversationMeta;

    fn logged_in() -> Engine {
        Engine::new(EngineConfig {
            username: Some(Username::new("me")),
            ..EngineConfig::default()
        })
    }

    fn meta(id: &str, ts: u64) -> ConversationMeta {
        ConversationMeta {
            last_activity_ms: ts,
            tlf_name: format!("me,{id}"),
            ..ConversationMeta::new(ConversationIdKey::resolved(id))
        }
    }

    fn remote_calls(commands: &[Command]) -> Vec<(&ReplyTag, &RemoteCall)> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Remote { tag, call } => Some((tag, call)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn select_loads_thread_and_page_folds() {
        let mut engine = logged_in();
        engine.metas.receive(vec![meta("c", 1)], MetaSource::Trusted);
        let commands = engine.handle(EngineEvent::SelectConversation {
            conversation: ConversationIdKey::resolved("c"),
        });
        let (tag, call) = remote_calls(&commands)[0];
        assert!(matches!(call, RemoteCall::GetThread { count: 50, continuation: None, .. }));

        let page = ThreadPage {
            conversation: ConversationIdKey::resolved("c"),
            messages: vec![RemoteMessage {
                id: MessageId(3),
                outbox_id: None,
                author: Username::new("bob"),
                timestamp_ms: 1,
                body: MessageBody::text("hey"),
                exploding_lifetime_secs: None,
                exploded_by: None,
                deleted: false,
                reactions: Default::default(),
            }],
            pagination: Some(Pagination { next: None, last: true }),
        };
        engine.handle(EngineEvent::RemoteSettled {
            tag: tag.clone(),
            result: Ok(RemoteReply::Thread(page)),
        });
        assert_eq!(engine.messages.messages(&ConversationIdKey::resolved("c")).count(), 1);
        assert!(engine.handle(EngineEvent::LoadOlderMessages).is_empty());
    }

    #[test]
    fn send_without_user_is_a_contract_error() {
        let mut engine = Engine::default();
        engine.selected = ConversationIdKey::resolved("c");
        assert_eq!(
            engine.try_handle(EngineEvent::SendText { text: "x".into() }),
            Err(EngineError::NotLoggedIn)
        );
        engine.handle(EngineEvent::SendText { text: "x".into() });
        assert!(engine.notice().is_some());
    }

    #[test]
    fn message_actions_without_user_are_contract_errors() {
        let mut engine = Engine::default();
        engine.selected = ConversationIdKey::resolved("c");
        let ordinal = Ordinal::integral(1);
        for event in [
            EngineEvent::EditMessage {
                ordinal,
                text: "x".into(),
            },
            EngineEvent::DeleteMessage { ordinal },
            EngineEvent::RetryMessage { ordinal },
        ] {
            assert_eq!(engine.try_handle(event), Err(EngineError::NotLoggedIn));
        }
    }

    #[test]
    fn send_while_composing_creates_once_and_flushes() {
        let mut engine = logged_in();
        let users: BTreeSet<Username> = [Username::new("alice")].into_iter().collect();
        engine.handle(EngineEvent::ComposeWithUsers {
            users: users.clone(),
            from_reset: false,
        });
        engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::FindExisting {
                participants: users.clone(),
            },
            result: Ok(RemoteReply::Found { conversations: vec![] }),
        });

        let first = engine.handle(EngineEvent::SendText { text: "one".into() });
        let second = engine.handle(EngineEvent::SendText { text: "two".into() });
        let creates = remote_calls(&first)
            .into_iter()
            .chain(remote_calls(&second))
            .filter(|(_, call)| matches!(call, RemoteCall::CreateConversation { .. }))
            .count();
        assert_eq!(creates, 1);

        let commands = engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::Create { participants: users },
            result: Ok(RemoteReply::Created {
                conversation: meta("new", 5),
            }),
        });
        let posted: Vec<&str> = remote_calls(&commands)
            .into_iter()
            .filter_map(|(_, call)| match call {
                RemoteCall::PostText { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(posted, vec!["one", "two"]);
        assert_eq!(engine.selected(), &ConversationIdKey::resolved("new"));
        assert!(!engine.pending().is_active());
    }

    fn compose_and_send_before_lookup(engine: &mut Engine) -> BTreeSet<Username> {
        let users: BTreeSet<Username> = [Username::new("alice")].into_iter().collect();
        engine.handle(EngineEvent::ComposeWithUsers {
            users: users.clone(),
            from_reset: false,
        });
        engine.handle(EngineEvent::SendText { text: "hi".into() });
        users
    }

    #[test]
    fn failed_lookup_creates_for_held_sends() {
        let mut engine = logged_in();
        let users = compose_and_send_before_lookup(&mut engine);
        let commands = engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::FindExisting { participants: users },
            result: Err(crate::error::RemoteError::network("offline")),
        });
        assert!(remote_calls(&commands)
            .iter()
            .any(|(_, call)| matches!(call, RemoteCall::CreateConversation { .. })));
        assert!(engine.notice().is_none());
    }

    #[test]
    fn unidentifiable_participant_fails_held_sends() {
        let mut engine = logged_in();
        let users = compose_and_send_before_lookup(&mut engine);
        let commands = engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::FindExisting { participants: users },
            result: Err(crate::error::RemoteError::new(
                crate::error::RemoteErrorClass::Identify,
                "failed to identify \"alice\"",
            )),
        });
        assert!(remote_calls(&commands).is_empty());
        assert!(engine.broken_users().contains(&Username::new("alice")));
        assert!(engine
            .messages
            .messages(&ConversationIdKey::Pending)
            .all(|m| matches!(m.state, crate::message::MessageState::Failed { .. })));
        assert!(engine.notice().is_some());
    }

    #[test]
    fn missing_team_channel_is_reported() {
        let mut engine = logged_in();
        let result = engine.try_handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::FindTeamChannel {
                team: TeamName::new("acme"),
                channel: "general".into(),
            },
            result: Ok(RemoteReply::Found { conversations: vec![] }),
        });
        assert!(matches!(result, Err(EngineError::NonExistentChannel { .. })));
    }

    #[test]
    fn reconfigure_resizes_resolved_outbox_memory() {
        let mut engine = logged_in();
        engine.reconfigure(EngineConfig {
            username: Some(Username::new("me")),
            resolved_outbox_memory: 3,
            ..EngineConfig::default()
        });
        assert_eq!(engine.sender.outbox().resolved_memory(), 3);
    }

    #[test]
    fn logout_clears_everything() {
        let mut engine = logged_in();
        engine.metas.receive(vec![meta("c", 1)], MetaSource::Trusted);
        engine.handle(EngineEvent::SetUser { username: None });
        assert!(engine.metas().is_empty());
        assert_eq!(engine.config().username, None);
    }
}
