//! Conversation metadata as known locally, and its trust lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::ids::{ConversationIdKey, MessageId, TeamName, Username};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustedState {
    #[default]
    Untrusted,
    Requesting,
    Trusted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TeamType {
    #[default]
    Adhoc,
    Small,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MembershipType {
    #[default]
    Active,
    YouArePreviewing,
    YouAreReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Inherit,
    Retain,
    Expire { seconds: u64 },
    Explode { seconds: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NotificationSettings {
    pub desktop_mentions_only: bool,
    pub mobile_mentions_only: bool,
    pub ignore_channel_wide: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConversationMeta {
    pub id: ConversationIdKey,
    pub trusted_state: TrustedState,
    pub participants: BTreeSet<Username>,
    pub reset_participants: BTreeSet<Username>,
    pub rekeyers: BTreeSet<Username>,
    pub team_type: TeamType,
    pub team_name: Option<TeamName>,
    pub channel_name: Option<String>,
    pub tlf_name: String,
    pub last_activity_ms: u64,
    pub max_message_id: Option<MessageId>,
    pub is_muted: bool,
    pub retention_policy: RetentionPolicy,
    pub team_retention_policy: RetentionPolicy,
    pub membership_type: MembershipType,
    pub min_writer_role: Option<String>,
    pub notification_settings: NotificationSettings,
    pub error: Option<String>,
}

impl ConversationMeta {
    pub fn new(id: ConversationIdKey) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Reset or awaiting rekey: the thread can't be fetched yet.
    #[must_use]
    pub fn is_unkeyed(&self) -> bool {
        self.membership_type == MembershipType::YouAreReset || !self.rekeyers.is_empty()
    }
}

/// Where a batch of metas came from; decides how far it may overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaSource {
    Untrusted,
    Trusted,
}

#[derive(Debug, Default)]
pub struct MetaStore {
    metas: HashMap<ConversationIdKey, ConversationMeta>,
}

impl MetaStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &ConversationIdKey) -> Option<&ConversationMeta> {
        self.metas.get(id)
    }

    pub fn get_mut(&mut self, id: &ConversationIdKey) -> Option<&mut ConversationMeta> {
        self.metas.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ConversationIdKey) -> bool {
        self.metas.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Unknown conversations count as untrusted.
    #[must_use]
    pub fn trusted_state(&self, id: &ConversationIdKey) -> TrustedState {
        self.metas
            .get(id)
            .map_or(TrustedState::Untrusted, |m| m.trusted_state)
    }

    /// Merges metas into the store.
    ///
    /// An untrusted sighting never downgrades a meta that is already
    /// requesting, trusted or errored; it only refreshes the activity fields.
    pub fn receive(&mut self, metas: Vec<ConversationMeta>, source: MetaSource) {
        for mut incoming in metas {
            if !incoming.id.is_valid() {
                debug!(conversation = %incoming.id, "dropping meta with invalid id");
                continue;
            }
            match (source, self.metas.get_mut(&incoming.id)) {
                (MetaSource::Untrusted, Some(existing))
                    if existing.trusted_state != TrustedState::Untrusted =>
                {
                    existing.last_activity_ms =
                        existing.last_activity_ms.max(incoming.last_activity_ms);
                    existing.max_message_id = existing.max_message_id.max(incoming.max_message_id);
                }
                (MetaSource::Untrusted, _) => {
                    incoming.trusted_state = TrustedState::Untrusted;
                    self.metas.insert(incoming.id.clone(), incoming);
                }
                (MetaSource::Trusted, _) => {
                    incoming.trusted_state = TrustedState::Trusted;
                    incoming.error = None;
                    self.metas.insert(incoming.id.clone(), incoming);
                }
            }
        }
    }

    /// Valid ids that should go out in a trusted request. A forced request
    /// takes every valid id; otherwise only still-untrusted ones.
    #[must_use]
    pub fn ids_to_request(&self, ids: &[ConversationIdKey], force: bool) -> Vec<ConversationIdKey> {
        let mut seen = HashSet::new();
        ids.iter()
            .filter(|id| id.is_valid())
            .filter(|id| force || self.trusted_state(id) == TrustedState::Untrusted)
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }

    /// Moves known metas to `Requesting`. Only a forced request may pull a
    /// trusted or errored meta back.
    pub fn mark_requesting(&mut self, ids: &[ConversationIdKey], force: bool) {
        for id in ids {
            if let Some(meta) = self.metas.get_mut(id) {
                if force || meta.trusted_state == TrustedState::Untrusted {
                    meta.trusted_state = TrustedState::Requesting;
                }
            }
        }
    }

    /// Puts metas still `Requesting` back to `Untrusted` so the next pass
    /// asks for them again.
    pub fn release_requesting(&mut self, ids: &[ConversationIdKey]) {
        for id in ids {
            if let Some(meta) = self.metas.get_mut(id) {
                if meta.trusted_state == TrustedState::Requesting {
                    meta.trusted_state = TrustedState::Untrusted;
                }
            }
        }
    }

    pub fn mark_error(&mut self, id: &ConversationIdKey, reason: impl Into<String>) {
        let meta = self
            .metas
            .entry(id.clone())
            .or_insert_with(|| ConversationMeta::new(id.clone()));
        meta.trusted_state = TrustedState::Error;
        meta.error = Some(reason.into());
    }

    pub fn remove(&mut self, id: &ConversationIdKey) -> Option<ConversationMeta> {
        self.metas.remove(id)
    }

    /// Drops every meta not in `keep`. Returns the removed ids.
    pub fn retain_only(&mut self, keep: &HashSet<ConversationIdKey>) -> Vec<ConversationIdKey> {
        let removed: Vec<ConversationIdKey> = self
            .metas
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &removed {
            self.metas.remove(id);
        }
        removed
    }

    pub fn clear(&mut self) {
        self.metas.clear();
    }

    /// Metas ordered by recency, newest first. Ties break on id so the order
    /// is stable.
    #[must_use]
    pub fn by_recency(&self) -> Vec<&ConversationMeta> {
        let mut rows: Vec<&ConversationMeta> = self.metas.values().collect();
        rows.sort_by(|a, b| {
            b.last_activity_ms
                .cmp(&a.last_activity_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        rows
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationMeta> {
        self.metas.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, ts: u64) -> ConversationMeta {
        ConversationMeta {
            last_activity_ms: ts,
            tlf_name: format!("me,{id}"),
            ..ConversationMeta::new(ConversationIdKey::resolved(id))
        }
    }

    #[test]
    fn unknown_is_untrusted() {
        let store = MetaStore::new();
        assert_eq!(
            store.trusted_state(&ConversationIdKey::resolved("x")),
            TrustedState::Untrusted
        );
    }

    #[test]
    fn untrusted_refresh_does_not_downgrade() {
        let mut store = MetaStore::new();
        store.receive(vec![meta("a", 1)], MetaSource::Trusted);
        store.receive(vec![meta("a", 5)], MetaSource::Untrusted);
        let a = store.get(&ConversationIdKey::resolved("a")).unwrap();
        assert_eq!(a.trusted_state, TrustedState::Trusted);
        assert_eq!(a.last_activity_ms, 5);
    }

    #[test]
    fn requesting_only_moves_forward_without_force() {
        let mut store = MetaStore::new();
        let a = ConversationIdKey::resolved("a");
        store.receive(vec![meta("a", 1)], MetaSource::Trusted);
        store.mark_requesting(&[a.clone()], false);
        assert_eq!(store.trusted_state(&a), TrustedState::Trusted);
        store.mark_requesting(&[a.clone()], true);
        assert_eq!(store.trusted_state(&a), TrustedState::Requesting);
    }

    #[test]
    fn released_requests_can_be_asked_again() {
        let mut store = MetaStore::new();
        let a = ConversationIdKey::resolved("a");
        let t = ConversationIdKey::resolved("t");
        store.receive(vec![meta("a", 1)], MetaSource::Untrusted);
        store.receive(vec![meta("t", 1)], MetaSource::Trusted);
        store.mark_requesting(&[a.clone()], false);
        store.release_requesting(&[a.clone(), t.clone()]);
        assert_eq!(store.trusted_state(&a), TrustedState::Untrusted);
        assert_eq!(store.trusted_state(&t), TrustedState::Trusted);
        assert_eq!(store.ids_to_request(&[a.clone()], false), vec![a]);
    }

    #[test]
    fn ids_to_request_filters_and_dedups() {
        let mut store = MetaStore::new();
        store.receive(vec![meta("t", 1)], MetaSource::Trusted);
        let ids = vec![
            ConversationIdKey::resolved("t"),
            ConversationIdKey::resolved("u"),
            ConversationIdKey::resolved("u"),
            ConversationIdKey::Pending,
        ];
        assert_eq!(
            store.ids_to_request(&ids, false),
            vec![ConversationIdKey::resolved("u")]
        );
        assert_eq!(store.ids_to_request(&ids, true).len(), 2);
    }

    #[test]
    fn by_recency_orders_newest_first() {
        let mut store = MetaStore::new();
        store.receive(vec![meta("old", 1), meta("new", 9), meta("mid", 5)], MetaSource::Untrusted);
        let order: Vec<String> = store.by_recency().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(order, vec!["new", "mid", "old"]);
    }

    #[test]
    fn error_creates_stub_when_unknown() {
        let mut store = MetaStore::new();
        let id = ConversationIdKey::resolved("e");
        store.mark_error(&id, "boxed badly");
        assert_eq!(store.trusted_state(&id), TrustedState::Error);
        assert_eq!(store.get(&id).unwrap().error.as_deref(), Some("boxed badly"));
    }
}
