//! Read-only projection of engine state for the UI.

use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::Notice;
use crate::ids::{ConversationIdKey, MessageId, TeamName, Username};
use crate::message::Message;
use crate::meta::{ConversationMeta, MembershipType, TeamType, TrustedState};
use crate::ordinal::Ordinal;
use crate::pending::PendingConversationState;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ConversationRow {
    pub id: ConversationIdKey,
    pub name: String,
    pub team_name: Option<TeamName>,
    pub channel_name: Option<String>,
    pub team_type: TeamType,
    pub trusted_state: TrustedState,
    pub membership_type: MembershipType,
    pub last_activity_ms: u64,
    pub max_message_id: Option<MessageId>,
    pub is_muted: bool,
    pub is_selected: bool,
    pub error: Option<String>,
}

impl ConversationRow {
    fn from_meta(meta: &ConversationMeta, selected: &ConversationIdKey) -> Self {
        let name = match (&meta.team_name, &meta.channel_name) {
            (Some(team), Some(channel)) => format!("{team}#{channel}"),
            (Some(team), None) => team.to_string(),
            _ => meta.tlf_name.clone(),
        };
        Self {
            id: meta.id.clone(),
            name,
            team_name: meta.team_name.clone(),
            channel_name: meta.channel_name.clone(),
            team_type: meta.team_type,
            trusted_state: meta.trusted_state,
            membership_type: meta.membership_type,
            last_activity_ms: meta.last_activity_ms,
            max_message_id: meta.max_message_id,
            is_muted: meta.is_muted,
            is_selected: &meta.id == selected,
            error: meta.error.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ViewModel {
    pub conversations: Vec<ConversationRow>,
    pub selected: ConversationIdKey,
    /// The selected thread in ordinal order.
    pub messages: Vec<Message>,
    pub editing: Option<Ordinal>,
    pub more_to_load: bool,
    pub compose: Option<PendingConversationState>,
    pub typers: Vec<Username>,
    pub broken_users: Vec<Username>,
    pub exploding_seconds: Option<u64>,
    pub confirm_pending: bool,
    pub notice: Option<Notice>,
}

#[must_use]
pub fn project(engine: &Engine) -> ViewModel {
    let selected = engine.selected().clone();
    let thread = engine.thread_key();

    let conversations = engine
        .metas()
        .by_recency()
        .into_iter()
        .filter(|m| m.id.is_valid())
        .map(|m| ConversationRow::from_meta(m, &selected))
        .collect();

    let compose = engine
        .pending()
        .is_active()
        .then(|| engine.pending().state().clone());

    ViewModel {
        conversations,
        messages: engine.messages().messages(&thread).cloned().collect(),
        editing: engine.editing(),
        more_to_load: thread.is_valid() && engine.paginator().more_to_load(&thread),
        compose,
        typers: engine
            .typers(&thread)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default(),
        broken_users: engine.broken_users().iter().cloned().collect(),
        exploding_seconds: engine.sender().exploding_mode(&thread),
        confirm_pending: engine.sender().confirm_pending().is_some(),
        notice: engine.notice().cloned(),
        selected,
    }
}
