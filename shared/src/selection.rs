use tracing::debug;

use crate::ids::{ConversationIdKey, TeamName};
use crate::meta::{ConversationMeta, MetaStore, TeamType};

fn eligible(meta: &ConversationMeta, avoid_team: Option<&TeamName>) -> bool {
    meta.id.is_valid()
        && meta.team_type != TeamType::Big
        && !(avoid_team.is_some() && meta.team_name.as_ref() == avoid_team)
}

/// The most recently active conversation worth selecting automatically, or
/// `NoConversation` when nothing qualifies.
#[must_use]
pub fn newest_eligible(metas: &MetaStore, avoid_team: Option<&TeamName>) -> ConversationIdKey {
    let picked = metas
        .by_recency()
        .into_iter()
        .find(|meta| eligible(meta, avoid_team))
        .map_or(ConversationIdKey::NoConversation, |meta| meta.id.clone());
    debug!(conversation = %picked, avoid_team = ?avoid_team, "auto-selected conversation");
    picked
}

/// Only an empty selection gets replaced when metadata arrives.
#[must_use]
pub fn wants_autoselect(selected: &ConversationIdKey) -> bool {
    *selected == ConversationIdKey::NoConversation
}
