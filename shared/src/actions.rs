//! User actions on whole conversations.

use tracing::{debug, error, info, warn};

use crate::capabilities::{RemoteCall, RemoteResult};
use crate::command::{Command, ReplyTag};
use crate::engine::Engine;
use crate::error::Notice;
use crate::ids::{ConversationIdKey, MessageId, TeamName};
use crate::meta::RetentionPolicy;
use crate::selection;

impl Engine {
    pub(crate) fn join(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        if !conversation.is_valid() {
            warn!(conversation = %conversation, "join of an invalid conversation");
            return vec![];
        }
        info!(conversation = %conversation, "joining conversation");
        vec![Command::fire(RemoteCall::JoinConversation {
            conversation: conversation.clone(),
        })]
    }

    pub(crate) fn leave(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        if !conversation.is_valid() {
            warn!(conversation = %conversation, "leave of an invalid conversation");
            return vec![];
        }
        info!(conversation = %conversation, "leaving conversation");
        vec![Command::remote(
            ReplyTag::Leave {
                conversation: conversation.clone(),
                avoid_team: None,
            },
            RemoteCall::LeaveConversation {
                conversation: conversation.clone(),
            },
        )]
    }

    pub(crate) fn leave_team(&mut self, team: TeamName) -> Vec<Command> {
        info!(team = %team, "leaving team");
        let in_team = self
            .metas
            .get(&self.selected)
            .is_some_and(|m| m.team_name.as_ref() == Some(&team));
        let conversation = if in_team {
            self.selected.clone()
        } else {
            ConversationIdKey::NoConversation
        };
        vec![Command::remote(
            ReplyTag::Leave {
                conversation,
                avoid_team: Some(team.clone()),
            },
            RemoteCall::LeaveTeam { team },
        )]
    }

    pub(crate) fn block(&mut self, conversation: &ConversationIdKey, report: bool) -> Vec<Command> {
        if !conversation.is_valid() {
            warn!(conversation = %conversation, "block of an invalid conversation");
            return vec![];
        }
        info!(conversation = %conversation, report, "blocking conversation");
        vec![Command::remote(
            ReplyTag::Block {
                conversation: conversation.clone(),
            },
            RemoteCall::BlockConversation {
                conversation: conversation.clone(),
                report,
            },
        )]
    }

    /// The conversation is gone for us. Leaving a team drops every
    /// conversation of that team, and the next selection avoids it.
    pub(crate) fn on_left(
        &mut self,
        conversation: &ConversationIdKey,
        avoid_team: Option<&TeamName>,
        result: RemoteResult,
    ) -> Vec<Command> {
        if let Err(e) = result {
            if e.is_transient() {
                warn!(conversation = %conversation, error = %e, "leave failed");
                return vec![];
            }
            error!(conversation = %conversation, error = %e, "leave rejected");
            return vec![Command::Notify(Notice::fatal(e.user_facing_message()))];
        }

        let mut gone: Vec<ConversationIdKey> = Vec::new();
        if conversation.is_valid() {
            gone.push(conversation.clone());
        }
        if let Some(team) = avoid_team {
            gone.extend(
                self.metas
                    .iter()
                    .filter(|m| m.team_name.as_ref() == Some(team))
                    .map(|m| m.id.clone()),
            );
        }
        for id in &gone {
            self.metas.remove(id);
            self.forget_conversation(id);
        }

        let mut commands = vec![Command::Render];
        if gone.contains(&self.selected) {
            let next = selection::newest_eligible(&self.metas, avoid_team);
            info!(from = %self.selected, to = %next, "reselecting after leave");
            commands.extend(self.select(next));
        }
        commands
    }

    pub(crate) fn mute(&mut self, conversation: &ConversationIdKey, muted: bool) -> Vec<Command> {
        let Some(meta) = self.metas.get_mut(conversation) else {
            warn!(conversation = %conversation, "mute of unknown conversation");
            return vec![];
        };
        meta.is_muted = muted;
        vec![
            Command::Render,
            Command::fire(RemoteCall::MuteConversation {
                conversation: conversation.clone(),
                muted,
            }),
        ]
    }

    pub(crate) fn set_retention(&mut self, conversation: &ConversationIdKey, policy: RetentionPolicy) -> Vec<Command> {
        if !conversation.is_valid() {
            warn!(conversation = %conversation, "retention for an invalid conversation");
            return vec![];
        }
        vec![Command::fire(RemoteCall::SetRetention {
            conversation: conversation.clone(),
            policy,
        })]
    }

    /// Deletes everything up to and including the newest message we know of.
    pub(crate) fn delete_history(&mut self, conversation: &ConversationIdKey) -> Vec<Command> {
        let Some(meta) = self.metas.get(conversation) else {
            warn!(conversation = %conversation, "delete history of unknown conversation");
            return vec![];
        };
        if meta.tlf_name.is_empty() {
            warn!(conversation = %conversation, "delete history without a tlf name");
            return vec![];
        }
        let Some(newest) = self.newest_known_id(conversation) else {
            debug!(conversation = %conversation, "no history to delete");
            return vec![];
        };
        let upto = MessageId(newest.0.saturating_add(1));
        info!(conversation = %conversation, upto = upto.0, "deleting history");
        vec![Command::fire(RemoteCall::DeleteHistory {
            conversation: conversation.clone(),
            tlf_name: meta.tlf_name.clone(),
            upto,
        })]
    }

    pub(crate) fn mark_read(&mut self) -> Vec<Command> {
        let conversation = self.selected.clone();
        if !conversation.is_valid() || !self.metas.contains(&conversation) {
            debug!(conversation = %conversation, "nothing to mark read");
            return vec![];
        }
        let Some(message_id) = self.newest_known_id(&conversation) else {
            return vec![];
        };
        vec![Command::fire(RemoteCall::MarkRead {
            conversation,
            message_id,
        })]
    }

    fn newest_known_id(&self, conversation: &ConversationIdKey) -> Option<MessageId> {
        let loaded = self.messages.newest_confirmed_id(conversation);
        let meta = self.metas.get(conversation).and_then(|m| m.max_message_id);
        loaded.max(meta)
    }

    /// Stored locally right away; a pending composition gets the mode when
    /// it resolves.
    pub(crate) fn set_exploding_mode(&mut self, conversation: &ConversationIdKey, seconds: u64) -> Vec<Command> {
        self.sender.set_exploding_mode(conversation, seconds);
        if !conversation.is_valid() {
            return vec![Command::Render];
        }
        vec![
            Command::Render,
            Command::remote(
                ReplyTag::ExplodingMode {
                    conversation: conversation.clone(),
                    seconds,
                },
                RemoteCall::SetExplodingMode {
                    conversation: conversation.clone(),
                    seconds,
                },
            ),
        ]
    }

    pub(crate) fn on_exploding_mode_reply(
        &mut self,
        conversation: &ConversationIdKey,
        seconds: u64,
        result: RemoteResult,
    ) -> Vec<Command> {
        match result {
            Ok(_) => {
                debug!(conversation = %conversation, seconds, "exploding mode saved");
                vec![]
            }
            Err(e) if e.is_transient() => {
                debug!(conversation = %conversation, error = %e, "ignoring exploding mode failure");
                vec![]
            }
            Err(e) => {
                error!(conversation = %conversation, error = %e, "exploding mode rejected");
                vec![Command::Notify(Notice::fatal(e.user_facing_message()))]
            }
        }
    }

    pub(crate) fn send_typing(&mut self, typing: bool) -> Vec<Command> {
        if !self.selected.is_valid() {
            return vec![];
        }
        vec![Command::fire(RemoteCall::SendTyping {
            conversation: self.selected.clone(),
            typing,
        })]
    }
}
