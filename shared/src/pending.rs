//! Composition state for a conversation that has no identity yet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::capabilities::{RemoteCall, RemoteReply, RemoteResult};
use crate::command::{Command, ReplyTag};
use crate::error::RemoteError;
use crate::ids::{tlf_name_for, ConversationIdKey, Username};
use crate::meta::ConversationMeta;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PendingMode {
    #[default]
    None,
    FixedSetOfUsers,
    TeamBuilding,
    StartingFromAReset,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PendingStatus {
    #[default]
    Idle,
    Creating,
    Failed { reason: String },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct PendingConversationState {
    pub mode: PendingMode,
    pub candidate_users: BTreeSet<Username>,
    pub resolved: Option<ConversationIdKey>,
    pub status: PendingStatus,
}

/// Outcome of a find-existing reply.
#[derive(Debug, Clone, PartialEq)]
pub enum FindOutcome {
    /// Staged users changed since the query went out.
    Stale,
    Found(ConversationMeta),
    NotFound,
    Failed(RemoteError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// Created for a composition that has since changed or been cancelled.
    Orphaned(ConversationMeta),
    Created(ConversationMeta),
    Failed(RemoteError),
    /// The service named a conversation that isn't a real identity.
    InvalidIdentity(ConversationIdKey),
    Malformed,
}

#[derive(Debug, Default)]
pub struct PendingConversationResolver {
    state: PendingConversationState,
    creating: Option<BTreeSet<Username>>,
}

impl PendingConversationResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn state(&self) -> &PendingConversationState {
        &self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.mode != PendingMode::None
    }

    #[must_use]
    pub fn resolved(&self) -> Option<&ConversationIdKey> {
        self.state.resolved.as_ref()
    }

    /// Stages a composition by participants and asks whether a conversation
    /// with exactly these users already exists.
    pub fn compose_users(&mut self, users: BTreeSet<Username>, from_reset: bool, you: &Username) -> Vec<Command> {
        self.state = PendingConversationState {
            mode: if from_reset {
                PendingMode::StartingFromAReset
            } else {
                PendingMode::FixedSetOfUsers
            },
            candidate_users: users.clone(),
            resolved: None,
            status: PendingStatus::Idle,
        };
        self.creating = None;

        if users.is_empty() {
            self.state.resolved = Some(ConversationIdKey::NoConversation);
            return vec![Command::Render];
        }
        self.state.resolved = Some(ConversationIdKey::PendingWaiting);
        info!(count = users.len(), "looking for existing conversation");
        vec![
            Command::Render,
            Command::remote(
                ReplyTag::FindExisting {
                    participants: users.clone(),
                },
                RemoteCall::FindExisting {
                    tlf_name: tlf_name_for(&users, you),
                    participants: users,
                },
            ),
        ]
    }

    /// Team targets resolve straight into the inbox, so nothing is staged.
    pub fn begin_team_building(&mut self) {
        self.state = PendingConversationState {
            mode: PendingMode::TeamBuilding,
            ..PendingConversationState::default()
        };
    }

    /// Applies a find-existing reply unless the staged users moved on.
    pub fn on_find_existing(&mut self, snapshot: &BTreeSet<Username>, result: RemoteResult) -> FindOutcome {
        if !self.is_active() || &self.state.candidate_users != snapshot {
            debug!("discarding stale find-existing reply");
            return FindOutcome::Stale;
        }
        match result {
            Ok(RemoteReply::Found { conversations }) => {
                match conversations.into_iter().find(|m| m.id.is_valid()) {
                    Some(meta) => {
                        self.state.resolved = Some(meta.id.clone());
                        FindOutcome::Found(meta)
                    }
                    None => {
                        self.state.resolved = Some(ConversationIdKey::NoConversation);
                        FindOutcome::NotFound
                    }
                }
            }
            Ok(other) => {
                warn!(?other, "unexpected find-existing reply");
                self.state.resolved = Some(ConversationIdKey::NoConversation);
                FindOutcome::NotFound
            }
            Err(e) => {
                self.state.resolved = Some(ConversationIdKey::NoConversation);
                FindOutcome::Failed(e)
            }
        }
    }

    /// Selecting elsewhere ends team building with nobody picked, and
    /// selecting the resolved target ends the composition.
    pub fn on_select(&mut self, selected: &ConversationIdKey) {
        if !matches!(
            self.state.mode,
            PendingMode::FixedSetOfUsers | PendingMode::TeamBuilding
        ) {
            return;
        }
        let left_empty = selected.is_valid() && self.state.candidate_users.is_empty();
        let picked_target = self.state.resolved.as_ref() == Some(selected);
        if left_empty || picked_target {
            debug!(conversation = %selected, "pending composition superseded by selection");
            self.clear();
        }
    }

    /// The identity a send or load should use for `selected`.
    #[must_use]
    pub fn effective_identity(&self, selected: &ConversationIdKey) -> ConversationIdKey {
        if !selected.is_pending() {
            return selected.clone();
        }
        match &self.state.resolved {
            Some(target) if target.is_valid() => target.clone(),
            Some(ConversationIdKey::PendingWaiting) => ConversationIdKey::PendingWaiting,
            _ => ConversationIdKey::Pending,
        }
    }

    /// True once find-existing came back empty and nothing is being created.
    #[must_use]
    pub fn needs_creation(&self) -> bool {
        self.is_active()
            && self.state.resolved == Some(ConversationIdKey::NoConversation)
            && !self.state.candidate_users.is_empty()
            && self.creating.is_none()
    }

    /// Creates the staged conversation. A second call for the same
    /// participants while one is in flight issues nothing.
    pub fn create_conversation(&mut self, you: &Username) -> Option<Command> {
        if !self.is_active() || self.state.candidate_users.is_empty() {
            return None;
        }
        if self.creating.as_ref() == Some(&self.state.candidate_users) {
            debug!("conversation creation already in flight");
            return None;
        }
        let participants = self.state.candidate_users.clone();
        self.creating = Some(participants.clone());
        self.state.status = PendingStatus::Creating;
        info!(count = participants.len(), "creating conversation");
        Some(Command::remote(
            ReplyTag::Create {
                participants: participants.clone(),
            },
            RemoteCall::CreateConversation {
                tlf_name: tlf_name_for(&participants, you),
                participants,
            },
        ))
    }

    pub fn on_created(&mut self, participants: &BTreeSet<Username>, result: RemoteResult) -> CreateOutcome {
        let current = self.creating.as_ref() == Some(participants);
        if current {
            self.creating = None;
        }
        match result {
            Ok(RemoteReply::Created { conversation }) if conversation.id.is_valid() => {
                if current {
                    self.clear();
                    CreateOutcome::Created(conversation)
                } else {
                    CreateOutcome::Orphaned(conversation)
                }
            }
            Ok(RemoteReply::Created { conversation }) => {
                if current {
                    self.state.status = PendingStatus::Failed {
                        reason: "conversation could not be created".into(),
                    };
                }
                CreateOutcome::InvalidIdentity(conversation.id)
            }
            Ok(_) => {
                if current {
                    self.state.status = PendingStatus::Failed {
                        reason: "conversation could not be created".into(),
                    };
                }
                CreateOutcome::Malformed
            }
            Err(e) => {
                if current {
                    self.state.status = PendingStatus::Failed {
                        reason: e.user_facing_message(),
                    };
                }
                CreateOutcome::Failed(e)
            }
        }
    }

    pub fn clear(&mut self) {
        self.state = PendingConversationState::default();
        self.creating = None;
    }
}
