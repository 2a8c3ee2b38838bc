//! Per-conversation cursor state for thread loading.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::ids::ConversationIdKey;
use crate::message::ThreadPage;
use crate::meta::ConversationMeta;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoadReason {
    Selected,
    Scrollback,
    Stale,
    InboxSyncedClear,
    Created,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    pub more_to_load: bool,
    pub continuation: Option<String>,
    pub in_flight: Option<LoadId>,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self {
            more_to_load: true,
            continuation: None,
            in_flight: None,
        }
    }
}

/// A thread fetch the engine should issue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ThreadRequest {
    pub load_id: LoadId,
    pub conversation: ConversationIdKey,
    pub count: u32,
    pub continuation: Option<String>,
    pub reason: LoadReason,
}

/// How to fold one page into the message store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub conversation: ConversationIdKey,
    pub clear_existing: bool,
}

#[derive(Debug)]
struct Episode {
    conversation: ConversationIdKey,
    wants_clear: bool,
    cleared: bool,
    open_loads: usize,
}

#[derive(Debug)]
pub struct ThreadPaginator {
    states: HashMap<ConversationIdKey, PaginationState>,
    load_episodes: HashMap<LoadId, u64>,
    episodes: HashMap<u64, Episode>,
    next_load: u64,
    next_episode: u64,
    initial_count: u32,
    scrollback_count: u32,
}

impl Default for ThreadPaginator {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl ThreadPaginator {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            states: HashMap::new(),
            load_episodes: HashMap::new(),
            episodes: HashMap::new(),
            next_load: 1,
            next_episode: 1,
            initial_count: config.initial_load_count,
            scrollback_count: config.scrollback_load_count,
        }
    }

    pub fn reconfigure(&mut self, config: &EngineConfig) {
        self.initial_count = config.initial_load_count;
        self.scrollback_count = config.scrollback_load_count;
    }

    #[must_use]
    pub fn state(&self, conversation: &ConversationIdKey) -> Option<&PaginationState> {
        self.states.get(conversation)
    }

    #[must_use]
    pub fn more_to_load(&self, conversation: &ConversationIdKey) -> bool {
        self.states
            .get(conversation)
            .map_or(true, |s| s.more_to_load)
    }

    /// Decides whether to fetch and builds the request.
    ///
    /// `identity` may be a pending sentinel, in which case `pending_target`
    /// stands in for it. Returns `None` for every bail case.
    pub fn request_load(
        &mut self,
        identity: &ConversationIdKey,
        pending_target: Option<&ConversationIdKey>,
        meta: Option<&ConversationMeta>,
        reason: LoadReason,
        scrollback: bool,
    ) -> Option<ThreadRequest> {
        let conversation = if identity.is_pending() {
            match pending_target {
                Some(target) if target.is_valid() => target.clone(),
                _ => {
                    debug!(conversation = %identity, "no resolved target for pending load");
                    return None;
                }
            }
        } else {
            identity.clone()
        };

        if !conversation.is_valid() {
            debug!(conversation = %conversation, "bail load: invalid identity");
            return None;
        }
        if meta.is_some_and(ConversationMeta::is_unkeyed) {
            debug!(conversation = %conversation, "bail load: reset or awaiting rekey");
            return None;
        }

        let state = self.states.entry(conversation.clone()).or_default();
        if scrollback && !state.more_to_load {
            debug!(conversation = %conversation, "bail load: nothing more to scroll back to");
            return None;
        }

        let load_id = LoadId(self.next_load);
        self.next_load += 1;

        let joined = (!scrollback)
            .then(|| state.in_flight.and_then(|l| self.load_episodes.get(&l).copied()))
            .flatten()
            .filter(|e| self.episodes.get(e).is_some_and(|ep| ep.wants_clear));
        let episode = match joined {
            Some(episode) => episode,
            None => {
                let episode = self.next_episode;
                self.next_episode += 1;
                self.episodes.insert(
                    episode,
                    Episode {
                        conversation: conversation.clone(),
                        wants_clear: !scrollback,
                        cleared: false,
                        open_loads: 0,
                    },
                );
                episode
            }
        };
        if let Some(ep) = self.episodes.get_mut(&episode) {
            ep.open_loads += 1;
        }
        self.load_episodes.insert(load_id, episode);

        let (count, continuation) = if scrollback {
            (self.scrollback_count, state.continuation.clone())
        } else {
            (self.initial_count, None)
        };
        state.in_flight = Some(load_id);

        info!(
            conversation = %conversation,
            load_id = load_id.0,
            count,
            ?reason,
            "loading thread"
        );
        Some(ThreadRequest {
            load_id,
            conversation,
            count,
            continuation,
            reason,
        })
    }

    /// Accounts for one page of a load. The first fold of a fresh episode
    /// clears; every later fold appends.
    pub fn fold_page(&mut self, load_id: LoadId, page: &ThreadPage) -> Option<Fold> {
        let episode_id = *self.load_episodes.get(&load_id)?;
        let episode = self.episodes.get_mut(&episode_id)?;
        let clear_existing = episode.wants_clear && !episode.cleared;
        episode.cleared = true;
        let conversation = episode.conversation.clone();

        let state = self.states.entry(conversation.clone()).or_default();
        match &page.pagination {
            Some(pagination) => {
                state.more_to_load = !pagination.last;
                state.continuation = pagination.next.clone();
            }
            None => state.more_to_load = true,
        }
        Some(Fold {
            conversation,
            clear_existing,
        })
    }

    /// Ends a load whether it succeeded or not.
    pub fn complete(&mut self, load_id: LoadId) {
        let Some(episode_id) = self.load_episodes.remove(&load_id) else {
            return;
        };
        let finished = match self.episodes.get_mut(&episode_id) {
            Some(episode) => {
                episode.open_loads = episode.open_loads.saturating_sub(1);
                if let Some(state) = self.states.get_mut(&episode.conversation) {
                    if state.in_flight == Some(load_id) {
                        state.in_flight = None;
                    }
                }
                episode.open_loads == 0
            }
            None => false,
        };
        if finished {
            self.episodes.remove(&episode_id);
        }
    }

    pub fn forget(&mut self, conversation: &ConversationIdKey) {
        self.states.remove(conversation);
    }

    pub fn clear(&mut self) {
        self.states.clear();
        self.load_episodes.clear();
        self.episodes.clear();
    }
}
