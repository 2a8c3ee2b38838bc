//! Message activity: folding thread pages and message notifications into the
//! message store.

use std::collections::BTreeSet;
use tracing::{debug, error, warn};

use crate::capabilities::{RemoteReply, RemoteResult};
use crate::command::Command;
use crate::engine::Engine;
use crate::error::{EngineError, Notice, RemoteErrorClass};
use crate::ids::{ConversationIdKey, MessageId, OutboxId, Username};
use crate::message::{RemoteMessage, ThreadPage};
use crate::meta::{ConversationMeta, MetaSource};
use crate::notification::{FailedRecord, MessageMutation, ReactionUpdate, TypingState};
use crate::paginator::LoadId;

impl Engine {
    pub(crate) fn on_thread_reply(&mut self, load_id: LoadId, result: RemoteResult) -> Vec<Command> {
        let commands = match result {
            Ok(RemoteReply::Thread(page)) => self.fold_page(load_id, page),
            Ok(other) => {
                error!(?other, load_id = load_id.0, "thread reply without a page");
                vec![Command::Fail(EngineError::MissingRemoteData {
                    what: "thread page",
                })]
            }
            Err(e) if e.is_transient() => {
                warn!(load_id = load_id.0, error = %e, "thread load failed");
                vec![]
            }
            Err(e) => {
                error!(load_id = load_id.0, error = %e, "thread load rejected");
                vec![Command::Notify(Notice::fatal(e.user_facing_message()))]
            }
        };
        self.paginator.complete(load_id);
        commands
    }

    pub(crate) fn on_thread_cached(&mut self, load_id: LoadId, page: ThreadPage) -> Vec<Command> {
        self.fold_page(load_id, page)
    }

    fn fold_page(&mut self, load_id: LoadId, page: ThreadPage) -> Vec<Command> {
        let Some(fold) = self.paginator.fold_page(load_id, &page) else {
            debug!(load_id = load_id.0, "page for a finished load");
            return vec![];
        };
        if page.conversation != fold.conversation {
            warn!(
                expected = %fold.conversation,
                got = %page.conversation,
                "page for the wrong conversation"
            );
            return vec![];
        }
        let edits = self.acknowledge_echoes(&page.messages);
        debug!(
            conversation = %fold.conversation,
            count = page.messages.len(),
            clear = fold.clear_existing,
            "folding thread page"
        );
        self.messages
            .add(&fold.conversation, page.messages, fold.clear_existing);
        self.reapply_edits(&fold.conversation, edits);
        vec![Command::Render]
    }

    /// Settles the outbox entries our own echoes answer, collecting the texts
    /// those sends were edited to while in flight.
    fn acknowledge_echoes(&mut self, messages: &[RemoteMessage]) -> Vec<(OutboxId, String)> {
        messages
            .iter()
            .filter_map(|m| {
                let outbox_id = m.outbox_id.as_ref()?;
                let text = self.sender.acknowledge(outbox_id)?;
                Some((outbox_id.clone(), text))
            })
            .collect()
    }

    fn reapply_edits(&mut self, conversation: &ConversationIdKey, edits: Vec<(OutboxId, String)>) {
        for (outbox_id, text) in edits {
            debug!(conversation = %conversation, %outbox_id, "keeping in-flight edit over echo");
            self.messages.set_text_by_outbox(conversation, &outbox_id, &text);
        }
    }

    pub(crate) fn on_incoming_message(
        &mut self,
        conversation: &ConversationIdKey,
        message: Option<RemoteMessage>,
        mutation: Option<MessageMutation>,
        meta: Option<ConversationMeta>,
    ) -> Vec<Command> {
        if let Some(meta) = meta {
            if &meta.id == conversation {
                self.metas.receive(vec![meta], MetaSource::Trusted);
            }
        }
        if let Some(message) = message {
            if let Some(typers) = self.typers.get_mut(conversation) {
                typers.remove(&message.author);
            }
            let message = vec![message];
            let edits = self.acknowledge_echoes(&message);
            self.messages.add(conversation, message, false);
            self.reapply_edits(conversation, edits);
        }
        match mutation {
            Some(MessageMutation::Edit { target, text }) => {
                if !self.messages.set_text_by_id(conversation, target, &text) {
                    debug!(conversation = %conversation, %target, "edit for a message not loaded");
                }
            }
            Some(MessageMutation::Delete { targets, by }) => {
                let exploding = targets.iter().any(|id| {
                    self.messages
                        .by_id(conversation, *id)
                        .is_some_and(|m| m.is_exploding())
                });
                if exploding {
                    self.messages
                        .mark_exploded(conversation, &targets, by.as_ref());
                } else {
                    self.messages.mark_deleted(conversation, &targets);
                }
            }
            None => {}
        }
        vec![Command::Render]
    }

    pub(crate) fn on_messages_updated(
        &mut self,
        conversation: &ConversationIdKey,
        messages: Vec<RemoteMessage>,
    ) -> Vec<Command> {
        self.messages.update_existing(conversation, messages);
        vec![Command::Render]
    }

    pub(crate) fn on_ephemeral_purge(&mut self, conversation: &ConversationIdKey, ids: &[MessageId]) -> Vec<Command> {
        self.messages.mark_exploded(conversation, ids, None);
        vec![Command::Render]
    }

    pub(crate) fn on_expunge(
        &mut self,
        conversation: &ConversationIdKey,
        upto: MessageId,
        meta: Option<ConversationMeta>,
    ) -> Vec<Command> {
        if let Some(meta) = meta {
            self.metas.receive(vec![meta], MetaSource::Trusted);
        }
        let removed = self.messages.expunge(conversation, upto);
        debug!(conversation = %conversation, %upto, removed, "expunged history");
        vec![Command::Render]
    }

    pub(crate) fn on_reaction_update(
        &mut self,
        conversation: &ConversationIdKey,
        updates: Vec<ReactionUpdate>,
    ) -> Vec<Command> {
        if updates.is_empty() {
            debug!(conversation = %conversation, "empty reaction update");
            return vec![];
        }
        for update in updates {
            self.messages
                .set_reactions(conversation, update.target, update.reactions);
        }
        vec![Command::Render]
    }

    pub(crate) fn on_failed_message(&mut self, records: Vec<FailedRecord>) -> Vec<Command> {
        for record in records {
            if record.class == RemoteErrorClass::Identify {
                if let Some(user) = &record.username {
                    self.broken_users.insert(user.clone());
                }
            }
            let found = self.with_sender(|sender, ctx| {
                sender.message_failed(ctx, &record.conversation, &record.outbox_id, &record.reason)
            });
            if found {
                warn!(
                    conversation = %record.conversation,
                    outbox_id = %record.outbox_id,
                    class = record.class.code(),
                    "message failed"
                );
            } else {
                debug!(outbox_id = %record.outbox_id, "failure for an unknown outbox record");
            }
        }
        vec![Command::Render]
    }

    pub(crate) fn on_ready_to_send(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId) -> Vec<Command> {
        self.sender.ready_to_send(conversation, outbox_id);
        vec![]
    }

    pub(crate) fn on_post_confirm_required(&mut self, conversation: &ConversationIdKey, outbox_id: OutboxId) -> Vec<Command> {
        self.sender.confirm_required(conversation, outbox_id);
        vec![Command::Render]
    }

    pub(crate) fn on_upload_start(&mut self, conversation: &ConversationIdKey, outbox_id: &OutboxId) -> Vec<Command> {
        self.with_sender(|sender, ctx| sender.upload_started(ctx, conversation, outbox_id))
    }

    pub(crate) fn on_upload_progress(
        &mut self,
        conversation: &ConversationIdKey,
        outbox_id: &OutboxId,
        bytes_complete: u64,
        bytes_total: u64,
    ) -> Vec<Command> {
        self.with_sender(|sender, ctx| {
            sender.upload_progress(ctx, conversation, outbox_id, bytes_complete, bytes_total)
        })
    }

    pub(crate) fn on_typing_update(&mut self, conversations: Vec<TypingState>) -> Vec<Command> {
        let you = self.config.username.clone();
        for TypingState {
            conversation,
            mut typers,
        } in conversations
        {
            if let Some(you) = &you {
                typers.remove(you);
            }
            if typers.is_empty() {
                self.typers.remove(&conversation);
            } else {
                self.typers.insert(conversation, typers);
            }
        }
        vec![Command::Render]
    }

    pub(crate) fn on_identify_update(
        &mut self,
        broken: BTreeSet<Username>,
        fixed: &BTreeSet<Username>,
    ) -> Vec<Command> {
        self.broken_users.extend(broken);
        self.broken_users.retain(|u| !fixed.contains(u));
        vec![Command::Render]
    }

    pub(crate) fn on_set_conv_settings(
        &mut self,
        conversation: &ConversationIdKey,
        min_writer_role: Option<String>,
    ) -> Vec<Command> {
        let Some(meta) = self.metas.get_mut(conversation) else {
            warn!(conversation = %conversation, "settings for unknown conversation");
            return vec![];
        };
        meta.min_writer_role = min_writer_role;
        vec![Command::Render]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::EngineEvent;
    use crate::message::{MessageBody, MessageState};
    use crate::notification::Notification;
    use crate::ordinal::Ordinal;

    fn engine() -> Engine {
        let mut engine = Engine::new(EngineConfig {
            username: Some(Username::new("me")),
            ..EngineConfig::default()
        });
        engine.metas.receive(
            vec![ConversationMeta {
                tlf_name: "me,bob".into(),
                ..ConversationMeta::new(ConversationIdKey::resolved("c"))
            }],
            MetaSource::Trusted,
        );
        engine.selected = ConversationIdKey::resolved("c");
        engine
    }

    fn c() -> ConversationIdKey {
        ConversationIdKey::resolved("c")
    }

    fn remote(id: u64, text: &str) -> RemoteMessage {
        RemoteMessage {
            id: MessageId(id),
            outbox_id: None,
            author: Username::new("bob"),
            timestamp_ms: id,
            body: MessageBody::text(text),
            exploding_lifetime_secs: None,
            exploded_by: None,
            deleted: false,
            reactions: Default::default(),
        }
    }

    fn notify(engine: &mut Engine, n: Notification) {
        engine.handle(EngineEvent::Notification(n));
    }

    #[test]
    fn echo_upgrades_pending_in_place() {
        let mut engine = engine();
        engine.handle(EngineEvent::SendText { text: "hi".into() });
        let pending = engine.messages().messages(&c()).next().cloned().unwrap();
        let mut echo = remote(42, "hi");
        echo.outbox_id = pending.outbox_id.clone();
        echo.author = Username::new("me");
        notify(
            &mut engine,
            Notification::IncomingMessage {
                conversation: c(),
                message: Some(echo),
                mutation: None,
                meta: None,
            },
        );
        let messages: Vec<_> = engine.messages().messages(&c()).collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].ordinal, pending.ordinal);
        assert_eq!(messages[0].id, Some(MessageId(42)));
    }

    #[test]
    fn delete_of_exploding_message_explodes() {
        let mut engine = engine();
        let mut boom = remote(1, "secret");
        boom.exploding_lifetime_secs = Some(30);
        engine.messages.add(&c(), vec![boom, remote(2, "plain")], false);

        notify(
            &mut engine,
            Notification::IncomingMessage {
                conversation: c(),
                message: None,
                mutation: Some(MessageMutation::Delete {
                    targets: vec![MessageId(1)],
                    by: Some(Username::new("bob")),
                }),
                meta: None,
            },
        );
        notify(
            &mut engine,
            Notification::IncomingMessage {
                conversation: c(),
                message: None,
                mutation: Some(MessageMutation::Delete {
                    targets: vec![MessageId(2)],
                    by: None,
                }),
                meta: None,
            },
        );
        let by_id = |id| engine.messages().by_id(&c(), MessageId(id)).unwrap().state.clone();
        assert_eq!(
            by_id(1),
            MessageState::Exploded {
                by: Some(Username::new("bob"))
            }
        );
        assert_eq!(by_id(2), MessageState::Deleted);
    }

    #[test]
    fn expunge_removes_history_below_upto() {
        let mut engine = engine();
        engine
            .messages
            .add(&c(), vec![remote(1, "a"), remote(2, "b"), remote(3, "c")], false);
        notify(
            &mut engine,
            Notification::Expunge {
                conversation: c(),
                upto: MessageId(3),
                meta: None,
            },
        );
        let ids: Vec<_> = engine.messages().messages(&c()).filter_map(|m| m.id).collect();
        assert_eq!(ids, vec![MessageId(3)]);
    }

    #[test]
    fn failed_record_marks_message_and_broken_user() {
        let mut engine = engine();
        engine.handle(EngineEvent::SendText { text: "hi".into() });
        let outbox_id = engine
            .messages()
            .messages(&c())
            .next()
            .and_then(|m| m.outbox_id.clone())
            .unwrap();
        notify(
            &mut engine,
            Notification::FailedMessage {
                records: vec![FailedRecord {
                    conversation: c(),
                    outbox_id,
                    reason: "identify failed".into(),
                    class: RemoteErrorClass::Identify,
                    username: Some(Username::new("bob")),
                }],
            },
        );
        let message = engine.messages().messages(&c()).next().unwrap();
        assert!(matches!(message.state, MessageState::Failed { .. }));
        assert!(engine.broken_users().contains(&Username::new("bob")));
    }

    #[test]
    fn typing_excludes_self() {
        let mut engine = engine();
        notify(
            &mut engine,
            Notification::TypingUpdate {
                conversations: vec![TypingState {
                    conversation: c(),
                    typers: [Username::new("me"), Username::new("bob")].into_iter().collect(),
                }],
            },
        );
        let typers = engine.typers(&c()).unwrap();
        assert_eq!(typers.len(), 1);
        assert!(typers.contains(&Username::new("bob")));
    }

    #[test]
    fn edit_notification_replaces_text() {
        let mut engine = engine();
        engine.messages.add(&c(), vec![remote(7, "old")], false);
        notify(
            &mut engine,
            Notification::IncomingMessage {
                conversation: c(),
                message: None,
                mutation: Some(MessageMutation::Edit {
                    target: MessageId(7),
                    text: "new".into(),
                }),
                meta: None,
            },
        );
        let message = engine.messages().get(&c(), Ordinal::for_message(MessageId(7)));
        assert_eq!(message.and_then(|m| m.body.as_text()), Some("new"));
    }
}
