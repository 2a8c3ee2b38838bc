//! Backpressured queue of conversations waiting for trusted metadata.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tracing::debug;

use crate::config::EngineConfig;
use crate::ids::ConversationIdKey;
use crate::meta::{MetaStore, TrustedState};

/// Result of one drain: the ids to request now, and when to drain again.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Drain {
    pub batch: Vec<ConversationIdKey>,
    pub rearm: Option<Duration>,
}

/// Insertion-ordered set of untrusted conversation ids.
///
/// Drains take from the most recently enqueued end. While a follow-up drain
/// is scheduled, new work only joins the queue; the scheduled drain picks it
/// up, so at most one batch leaves per delay window.
#[derive(Debug)]
pub struct MetaUnboxQueue {
    order: VecDeque<ConversationIdKey>,
    members: HashSet<ConversationIdKey>,
    batch_size: usize,
    delay: Duration,
    drain_armed: bool,
}

impl Default for MetaUnboxQueue {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl MetaUnboxQueue {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            batch_size: config.unbox_batch_size.max(1),
            delay: config.unbox_drain_delay(),
            drain_armed: false,
        }
    }

    pub fn reconfigure(&mut self, config: &EngineConfig) {
        self.batch_size = config.unbox_batch_size.max(1);
        self.delay = config.unbox_drain_delay();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &ConversationIdKey) -> bool {
        self.members.contains(id)
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.drain_armed
    }

    /// Adds valid ids whose meta is untrusted or unknown. Returns whether the
    /// queue grew; re-adding queued ids is silent.
    pub fn enqueue<I>(&mut self, ids: I, metas: &MetaStore) -> bool
    where
        I: IntoIterator<Item = ConversationIdKey>,
    {
        let before = self.order.len();
        for id in ids {
            if !id.is_valid() || metas.trusted_state(&id) != TrustedState::Untrusted {
                continue;
            }
            if self.members.insert(id.clone()) {
                self.order.push_back(id);
            }
        }
        let grew = self.order.len() > before;
        if !grew {
            debug!("unbox queue unchanged");
        }
        grew
    }

    /// True when a queue-changed signal should drain right away rather than
    /// wait for the scheduled drain.
    #[must_use]
    pub fn should_drain_now(&self) -> bool {
        !self.drain_armed && !self.order.is_empty()
    }

    /// Takes up to one batch from the tail and re-arms if anything is left.
    /// Ids that stopped being untrusted while queued are dropped from the
    /// batch.
    pub fn drain(&mut self, metas: &MetaStore) -> Drain {
        let take = self.batch_size.min(self.order.len());
        let taken: Vec<ConversationIdKey> = self.order.split_off(self.order.len() - take).into();
        for id in &taken {
            self.members.remove(id);
        }
        let batch: Vec<ConversationIdKey> = taken
            .into_iter()
            .filter(|id| metas.trusted_state(id) == TrustedState::Untrusted)
            .collect();

        let rearm = (!self.order.is_empty()).then_some(self.delay);
        self.drain_armed = rearm.is_some();
        debug!(
            count = batch.len(),
            remaining = self.order.len(),
            "drained unbox queue"
        );
        Drain { batch, rearm }
    }

    pub fn remove(&mut self, id: &ConversationIdKey) {
        if self.members.remove(id) {
            self.order.retain(|queued| queued != id);
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
        self.drain_armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ConversationMeta, MetaSource};
    use proptest::prelude::*;

    fn id(n: usize) -> ConversationIdKey {
        ConversationIdKey::resolved(format!("conv{n}"))
    }

    #[test]
    fn twelve_items_drain_in_two_rounds() {
        let metas = MetaStore::new();
        let mut queue = MetaUnboxQueue::default();
        assert!(queue.enqueue((0..12).map(id), &metas));

        let first = queue.drain(&metas);
        assert_eq!(first.batch, (2..12).map(id).collect::<Vec<_>>());
        assert_eq!(first.rearm, Some(Duration::from_millis(100)));
        assert!(queue.is_armed());

        let second = queue.drain(&metas);
        assert_eq!(second.batch, vec![id(0), id(1)]);
        assert_eq!(second.rearm, None);
        assert!(queue.is_empty());
        assert!(!queue.is_armed());
    }

    #[test]
    fn skips_trusted_and_sentinel_ids() {
        let mut metas = MetaStore::new();
        metas.receive(vec![ConversationMeta::new(id(1))], MetaSource::Trusted);
        let mut queue = MetaUnboxQueue::default();
        queue.enqueue(vec![id(1), ConversationIdKey::Pending, id(2)], &metas);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&id(2)));
    }

    #[test]
    fn drops_ids_trusted_while_queued() {
        let mut metas = MetaStore::new();
        let mut queue = MetaUnboxQueue::default();
        queue.enqueue(vec![id(1), id(2)], &metas);
        metas.receive(vec![ConversationMeta::new(id(2))], MetaSource::Trusted);
        assert_eq!(queue.drain(&metas).batch, vec![id(1)]);
    }

    #[test]
    fn armed_queue_waits_for_scheduled_drain() {
        let metas = MetaStore::new();
        let mut queue = MetaUnboxQueue::default();
        queue.enqueue((0..15).map(id), &metas);
        assert!(queue.should_drain_now());
        queue.drain(&metas);
        assert!(queue.enqueue(vec![id(99)], &metas));
        assert!(!queue.should_drain_now());
    }

    proptest! {
        #[test]
        fn enqueue_is_set_like(batches in proptest::collection::vec(proptest::collection::vec(0usize..30, 0..8), 1..10)) {
            let metas = MetaStore::new();
            let mut queue = MetaUnboxQueue::default();
            let mut seen = HashSet::new();
            for batch in batches {
                let fresh = batch.iter().any(|n| !seen.contains(n));
                seen.extend(batch.iter().copied());
                let grew = queue.enqueue(batch.into_iter().map(id), &metas);
                prop_assert_eq!(grew, fresh);
                prop_assert_eq!(queue.len(), seen.len());
            }
        }

        #[test]
        fn drain_takes_newest_and_respects_batch_size(count in 0usize..60) {
            let metas = MetaStore::new();
            let mut queue = MetaUnboxQueue::default();
            queue.enqueue((0..count).map(id), &metas);
            let drained = queue.drain(&metas);
            prop_assert!(drained.batch.len() <= 10);
            let expected: Vec<_> = (count.saturating_sub(10)..count).map(id).collect();
            prop_assert_eq!(drained.batch, expected);
            prop_assert_eq!(drained.rearm.is_some(), count > 10);
        }
    }
}
