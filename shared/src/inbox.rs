//! Inbox sync and thread staleness: keeping the meta store in step with the
//! service's view of the inbox.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, error, info, warn};

use crate::capabilities::{RemoteCall, RemoteReply, RemoteResult};
use crate::command::{Command, ReplyTag};
use crate::engine::Engine;
use crate::error::{EngineError, Notice};
use crate::ids::ConversationIdKey;
use crate::meta::{ConversationMeta, MetaSource, TeamType};
use crate::notification::{InboxSync, StaleUpdate, StaleUpdateKind};
use crate::paginator::LoadReason;
use crate::selection;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RefreshReason {
    Bootstrapping,
    InboxStale,
    InboxSyncedClear,
    InboxSyncedUnknown,
    JoinedAConversation,
    LeftAConversation,
    TeamTypeChanged,
}

impl RefreshReason {
    /// Whether the result replaces the inbox rather than merging into it.
    #[must_use]
    pub const fn drops_missing(self) -> bool {
        matches!(self, Self::InboxSyncedClear | Self::LeftAConversation)
    }
}

impl Engine {
    pub(crate) fn refresh_inbox(&mut self, reason: RefreshReason) -> Vec<Command> {
        if self.config.username.is_none() {
            debug!(?reason, "not logged in, skipping inbox refresh");
            return vec![];
        }
        info!(?reason, "refreshing inbox");
        vec![Command::remote(
            ReplyTag::Inbox { reason },
            RemoteCall::GetInboxUntrusted,
        )]
    }

    pub(crate) fn on_inbox_reply(&mut self, reason: RefreshReason, result: RemoteResult) -> Vec<Command> {
        match result {
            Ok(RemoteReply::Inbox { conversations }) => self.merge_inbox(reason, conversations),
            Ok(other) => {
                error!(?other, "inbox reply without conversations");
                vec![Command::Fail(EngineError::MissingRemoteData { what: "inbox" })]
            }
            Err(e) if e.is_transient() => {
                warn!(?reason, error = %e, "inbox refresh failed");
                vec![]
            }
            Err(e) => {
                error!(?reason, error = %e, "inbox refresh rejected");
                vec![Command::Notify(Notice::fatal(e.user_facing_message()))]
            }
        }
    }

    fn merge_inbox(&mut self, reason: RefreshReason, metas: Vec<ConversationMeta>) -> Vec<Command> {
        let mut commands = vec![Command::Render];

        if reason.drops_missing() {
            let keep: HashSet<ConversationIdKey> = metas.iter().map(|m| m.id.clone()).collect();
            for id in self.metas.retain_only(&keep) {
                debug!(conversation = %id, "conversation gone from inbox");
                self.forget_conversation(&id);
            }
        }
        if reason == RefreshReason::InboxSyncedClear {
            self.messages.clear();
            self.paginator.clear();
        }

        commands.extend(self.receive_untrusted(metas));

        if selection::wants_autoselect(&self.selected) || !self.selected_still_exists() {
            let next = selection::newest_eligible(&self.metas, None);
            if next != self.selected {
                commands.extend(self.select(next));
            }
        } else if reason == RefreshReason::InboxSyncedClear {
            commands.extend(self.load_thread(LoadReason::InboxSyncedClear, false));
        }
        commands
    }

    /// Merges untrusted metas, queues them for unboxing, and asks for big-team
    /// channels right away so their names can be shown.
    pub(crate) fn receive_untrusted(&mut self, metas: Vec<ConversationMeta>) -> Vec<Command> {
        let ids: Vec<ConversationIdKey> = metas.iter().map(|m| m.id.clone()).collect();
        let unnamed_channels: Vec<ConversationIdKey> = metas
            .iter()
            .filter(|m| m.team_type == TeamType::Big && m.channel_name.is_none())
            .map(|m| m.id.clone())
            .collect();
        self.metas.receive(metas, MetaSource::Untrusted);

        let mut commands = self.request_trusted(&unnamed_channels, false);
        commands.extend(self.queue_metas(ids));
        commands
    }

    pub(crate) fn queue_metas(&mut self, ids: Vec<ConversationIdKey>) -> Vec<Command> {
        if self.unbox_queue.enqueue(ids, &self.metas) && self.unbox_queue.should_drain_now() {
            return self.drain_unbox_queue();
        }
        vec![]
    }

    pub(crate) fn drain_unbox_queue(&mut self) -> Vec<Command> {
        let drain = self.unbox_queue.drain(&self.metas);
        let mut commands = Vec::new();
        if !drain.batch.is_empty() {
            self.metas.mark_requesting(&drain.batch, false);
            info!(count = drain.batch.len(), "requesting trusted metas");
            commands.push(Command::remote(
                ReplyTag::Unbox {
                    conversations: drain.batch.clone(),
                },
                RemoteCall::GetInboxTrusted {
                    conversations: drain.batch,
                    force: false,
                },
            ));
        }
        if let Some(after) = drain.rearm {
            commands.push(Command::Schedule {
                after,
                event: crate::engine::EngineEvent::DrainUnboxQueue,
            });
        }
        commands
    }

    /// Trusted request outside the queue. Only `force` may pull a trusted or
    /// errored meta back to requesting.
    pub(crate) fn request_trusted(&mut self, ids: &[ConversationIdKey], force: bool) -> Vec<Command> {
        let ids = self.metas.ids_to_request(ids, force);
        if ids.is_empty() {
            return vec![];
        }
        for id in &ids {
            self.unbox_queue.remove(id);
        }
        self.metas.mark_requesting(&ids, force);
        info!(count = ids.len(), force, "requesting trusted metas");
        vec![Command::remote(
            ReplyTag::Unbox {
                conversations: ids.clone(),
            },
            RemoteCall::GetInboxTrusted {
                conversations: ids,
                force,
            },
        )]
    }

    pub(crate) fn on_unbox_reply(&mut self, requested: &[ConversationIdKey], result: RemoteResult) -> Vec<Command> {
        match result {
            Ok(RemoteReply::Unboxed {
                conversations,
                failures,
            }) => {
                self.metas.receive(conversations, MetaSource::Trusted);
                for failure in failures {
                    if failure.transient {
                        warn!(conversation = %failure.conversation, reason = %failure.message, "transient unbox failure");
                    } else {
                        error!(conversation = %failure.conversation, reason = %failure.message, "unbox failed");
                    }
                    self.metas.mark_error(&failure.conversation, failure.message);
                }
                let mut commands = vec![Command::Render];
                if selection::wants_autoselect(&self.selected) {
                    let next = selection::newest_eligible(&self.metas, None);
                    if next.is_valid() {
                        commands.extend(self.select(next));
                    }
                }
                commands
            }
            Ok(other) => {
                error!(?other, "unbox reply without conversations");
                vec![Command::Fail(EngineError::MissingRemoteData {
                    what: "unboxed conversations",
                })]
            }
            Err(e) if e.is_transient() => {
                warn!(count = requested.len(), error = %e, "trusted meta request failed");
                self.metas.release_requesting(requested);
                vec![Command::Render]
            }
            Err(e) => {
                error!(count = requested.len(), error = %e, "trusted meta request rejected");
                let reason = e.user_facing_message();
                for id in requested {
                    self.metas.mark_error(id, reason.clone());
                }
                vec![Command::Render]
            }
        }
    }

    fn selected_still_exists(&self) -> bool {
        !self.selected.is_valid() || self.metas.contains(&self.selected)
    }

    /// Drops everything held for a conversation that left the inbox.
    pub(crate) fn forget_conversation(&mut self, id: &ConversationIdKey) {
        self.messages.remove_conversation(id);
        self.paginator.forget(id);
        self.unbox_queue.remove(id);
        self.typers.remove(id);
        self.stale.remove(id);
        if self.pending.resolved() == Some(id) {
            self.pending.clear();
        }
    }

    pub(crate) fn on_inbox_synced(&mut self, sync: InboxSync) -> Vec<Command> {
        match sync {
            InboxSync::Clear => self.refresh_inbox(RefreshReason::InboxSyncedClear),
            InboxSync::Current => vec![],
            InboxSync::Incremental { items } => {
                let selected_touched = items.iter().any(|i| i.meta.id == self.selected);
                let unbox: Vec<ConversationIdKey> = items
                    .iter()
                    .filter(|i| i.should_unbox)
                    .map(|i| i.meta.id.clone())
                    .collect();
                let mut commands =
                    self.receive_untrusted(items.into_iter().map(|i| i.meta).collect());
                if selected_touched && self.selected.is_valid() {
                    self.stale.insert(self.selected.clone());
                }
                commands.extend(self.request_trusted(&unbox, true));
                commands.push(Command::Render);
                commands
            }
            InboxSync::Unknown => self.refresh_inbox(RefreshReason::InboxSyncedUnknown),
        }
    }

    pub(crate) fn on_inbox_stale(&mut self) -> Vec<Command> {
        self.refresh_inbox(RefreshReason::InboxStale)
    }

    pub(crate) fn on_joined_conversation(&mut self) -> Vec<Command> {
        self.refresh_inbox(RefreshReason::JoinedAConversation)
    }

    pub(crate) fn on_left_conversation(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        debug!(conversation = %conversation, "left conversation");
        self.refresh_inbox(RefreshReason::LeftAConversation)
    }

    pub(crate) fn on_team_type_changed(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        debug!(conversation = %conversation, "team type changed");
        self.refresh_inbox(RefreshReason::TeamTypeChanged)
    }

    pub(crate) fn on_threads_stale(&mut self, updates: Vec<StaleUpdate>) -> Vec<Command> {
        let mut metadata_only = Vec::new();
        let mut stale = Vec::new();
        for update in updates {
            match update.kind {
                StaleUpdateKind::ConvUpdate => metadata_only.push(update.conversation),
                StaleUpdateKind::NewActivity | StaleUpdateKind::Clear => {
                    stale.push(update.conversation);
                }
            }
        }
        let mut commands = self.request_trusted(&metadata_only, true);
        if stale.is_empty() {
            return commands;
        }

        info!(count = stale.len(), "threads stale");
        for id in &stale {
            if id.is_valid() {
                self.stale.insert(id.clone());
            }
        }
        commands.extend(self.request_trusted(&stale, true));
        if stale.contains(&self.selected) {
            commands.extend(self.load_thread(LoadReason::Stale, false));
        }
        commands.push(Command::Render);
        commands
    }

    pub(crate) fn on_subteam_rename(&mut self, conversations: &[ConversationIdKey]) -> Vec<Command> {
        self.request_trusted(conversations, true)
    }

    pub(crate) fn on_members_update(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        self.request_trusted(std::slice::from_ref(conversation), true)
    }

    pub(crate) fn on_set_conv_retention(
        &mut self,
        conversation: &ConversationIdKey,
        meta: Option<ConversationMeta>,
    ) -> Vec<Command> {
        match meta {
            Some(meta) if &meta.id == conversation => {
                self.metas.receive(vec![meta], MetaSource::Trusted);
                vec![Command::Render]
            }
            Some(meta) => {
                warn!(conversation = %conversation, got = %meta.id, "retention meta for another conversation");
                self.request_trusted(std::slice::from_ref(conversation), true)
            }
            None => self.request_trusted(std::slice::from_ref(conversation), true),
        }
    }

    pub(crate) fn on_set_team_retention(&mut self, metas: Vec<ConversationMeta>) -> Vec<Command> {
        if metas.is_empty() {
            debug!("team retention update without conversations");
            return vec![];
        }
        self.metas.receive(metas, MetaSource::Trusted);
        vec![Command::Render]
    }

    pub(crate) fn on_tlf_finalize(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        self.request_trusted(std::slice::from_ref(conversation), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineEvent;
    use crate::config::EngineConfig;
    use crate::ids::Username;
    use crate::meta::TrustedState;
    use crate::notification::{IncrementalItem, Notification};

    fn engine() -> Engine {
        Engine::new(EngineConfig {
            username: Some(Username::new("me")),
            ..EngineConfig::default()
        })
    }

    fn meta(id: &str, ts: u64) -> ConversationMeta {
        ConversationMeta {
            last_activity_ms: ts,
            ..ConversationMeta::new(ConversationIdKey::resolved(id))
        }
    }

    fn inbox(engine: &mut Engine, reason: RefreshReason, metas: Vec<ConversationMeta>) -> Vec<Command> {
        engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::Inbox { reason },
            result: Ok(RemoteReply::Inbox {
                conversations: metas,
            }),
        })
    }

    fn trusted_requests(commands: &[Command]) -> Vec<(Vec<ConversationIdKey>, bool)> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Remote {
                    call: RemoteCall::GetInboxTrusted {
                        conversations,
                        force,
                    },
                    ..
                } => Some((conversations.clone(), *force)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn untrusted_inbox_is_queued_and_drained() {
        let mut engine = engine();
        let commands = inbox(
            &mut engine,
            RefreshReason::Bootstrapping,
            (0..12).map(|i| meta(&format!("c{i}"), i)).collect(),
        );
        let requests = trusted_requests(&commands);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.len(), 10);
        assert!(commands
            .iter()
            .any(|c| matches!(c, Command::Schedule { event: EngineEvent::DrainUnboxQueue, .. })));
        assert_eq!(
            engine.metas().trusted_state(&ConversationIdKey::resolved("c11")),
            TrustedState::Requesting
        );
    }

    #[test]
    fn big_team_without_channel_name_is_requested_immediately() {
        let mut engine = engine();
        let big = ConversationMeta {
            team_type: TeamType::Big,
            ..meta("big", 1)
        };
        let commands = inbox(&mut engine, RefreshReason::Bootstrapping, vec![big]);
        let requests = trusted_requests(&commands);
        assert_eq!(requests, vec![(vec![ConversationIdKey::resolved("big")], false)]);
        assert!(engine.unbox_queue().is_empty());
    }

    #[test]
    fn clear_drops_missing_metas() {
        let mut engine = engine();
        inbox(&mut engine, RefreshReason::Bootstrapping, vec![meta("a", 1), meta("b", 2)]);
        inbox(&mut engine, RefreshReason::InboxSyncedClear, vec![meta("a", 1)]);
        assert!(engine.metas().contains(&ConversationIdKey::resolved("a")));
        assert!(!engine.metas().contains(&ConversationIdKey::resolved("b")));

        inbox(&mut engine, RefreshReason::InboxStale, vec![meta("c", 3)]);
        assert!(engine.metas().contains(&ConversationIdKey::resolved("a")));
    }

    #[test]
    fn first_trusted_batch_autoselects() {
        let mut engine = engine();
        let mut trusted = meta("a", 5);
        trusted.tlf_name = "me,a".into();
        engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::Unbox {
                conversations: vec![trusted.id.clone()],
            },
            result: Ok(RemoteReply::Unboxed {
                conversations: vec![trusted],
                failures: vec![],
            }),
        });
        assert_eq!(engine.selected(), &ConversationIdKey::resolved("a"));
    }

    fn fail_unbox(engine: &mut Engine, error: crate::error::RemoteError) {
        engine.handle(EngineEvent::RemoteSettled {
            tag: ReplyTag::Unbox {
                conversations: vec![ConversationIdKey::resolved("a")],
            },
            result: Err(error),
        });
    }

    #[test]
    fn transient_unbox_failure_leaves_rows_untrusted() {
        let mut engine = engine();
        inbox(&mut engine, RefreshReason::Bootstrapping, vec![meta("a", 1)]);
        fail_unbox(&mut engine, crate::error::RemoteError::timeout());
        let a = engine.metas().get(&ConversationIdKey::resolved("a")).unwrap();
        assert_eq!(a.trusted_state, TrustedState::Untrusted);
        assert_eq!(a.error, None);
        assert!(engine.notice().is_none());
    }

    #[test]
    fn rejected_unbox_marks_error_without_notice() {
        let mut engine = engine();
        inbox(&mut engine, RefreshReason::Bootstrapping, vec![meta("a", 1)]);
        fail_unbox(&mut engine, crate::error::RemoteError::rejected("cannot decrypt"));
        assert_eq!(
            engine.metas().trusted_state(&ConversationIdKey::resolved("a")),
            TrustedState::Error
        );
        assert!(engine.notice().is_none());
    }

    #[test]
    fn incremental_sync_forces_flagged_items() {
        let mut engine = engine();
        let commands = engine.handle(EngineEvent::Notification(Notification::InboxSynced(
            InboxSync::Incremental {
                items: vec![IncrementalItem {
                    meta: meta("x", 9),
                    should_unbox: true,
                }],
            },
        )));
        assert!(trusted_requests(&commands).contains(&(vec![ConversationIdKey::resolved("x")], true)));
    }

    #[test]
    fn stale_selected_thread_reloads() {
        let mut engine = engine();
        engine.metas.receive(vec![meta("a", 1)], MetaSource::Trusted);
        engine.selected = ConversationIdKey::resolved("a");
        let commands = engine.handle(EngineEvent::Notification(Notification::ThreadsStale {
            updates: vec![StaleUpdate {
                conversation: ConversationIdKey::resolved("a"),
                kind: StaleUpdateKind::NewActivity,
            }],
        }));
        assert!(commands.iter().any(|c| matches!(
            c,
            Command::Remote {
                call: RemoteCall::GetThread {
                    reason: LoadReason::Stale,
                    ..
                },
                ..
            }
        )));
        assert!(!engine.is_stale(&ConversationIdKey::resolved("a")));
    }
}
