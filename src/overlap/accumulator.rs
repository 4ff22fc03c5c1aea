use std::collections::{BTreeMap, HashMap};

use dashmap::{DashMap, DashSet};

use super::record::ChannelId;

/// Peer state owned by a single channel.
///
/// Both maps are sharded concurrent maps, so two workers writing into the same channel serialize
/// on a shard lock rather than racing.
#[derive(Debug, Default)]
struct PeerState {
    /// `peer -> shared identity count`. May hold zeroes; those are not overlaps.
    counts: DashMap<ChannelId, usize>,
    /// Peers with at least one identity in common.
    overlapping: DashSet<ChannelId>,
}

/// Concurrency-safe accumulator for pairwise overlap results.
///
/// The outer map is populated up front and never mutated afterwards, which means workers only
/// ever take a shared borrow on it; writes for disjoint channel pairs land in disjoint
/// [`PeerState`]s and never contend.
#[derive(Debug)]
pub struct OverlapAccumulator {
    channels: HashMap<ChannelId, PeerState>,
}

impl OverlapAccumulator {
    pub fn new<'a, I>(ids: I) -> Self
    where
        I: IntoIterator<Item = &'a ChannelId>,
    {
        let channels = ids
            .into_iter()
            .map(|id| (id.clone(), PeerState::default()))
            .collect();

        Self { channels }
    }

    /// Stores `count` as the shared count between `a` and `b` in both directions.
    pub fn record_shared_count(&self, a: &ChannelId, b: &ChannelId, count: usize) {
        if let Some(state) = self.state(a) {
            state.counts.insert(b.clone(), count);
        }

        if let Some(state) = self.state(b) {
            state.counts.insert(a.clone(), count);
        }
    }

    /// Marks `a` and `b` as overlapping peers of one another.
    ///
    /// Idempotent: repeated calls for the same pair, one per shared identity, leave the
    /// distinct peer count unchanged.
    pub fn mark_overlapping(&self, a: &ChannelId, b: &ChannelId) {
        if let Some(state) = self.state(a) {
            state.overlapping.insert(b.clone());
        }

        if let Some(state) = self.state(b) {
            state.overlapping.insert(a.clone());
        }
    }

    pub fn total_distinct_overlap(&self, id: &ChannelId) -> usize {
        self.channels
            .get(id)
            .map(|state| state.overlapping.len())
            .unwrap_or_default()
    }

    /// Nonzero shared counts for a channel, keyed by peer.
    pub fn shared_counts(&self, id: &ChannelId) -> BTreeMap<ChannelId, usize> {
        self.channels
            .get(id)
            .map(|state| {
                state
                    .counts
                    .iter()
                    .filter(|entry| *entry.value() > 0)
                    .map(|entry| (entry.key().clone(), *entry.value()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.channels.keys()
    }

    fn state(&self, id: &ChannelId) -> Option<&PeerState> {
        let state = self.channels.get(id);
        if state.is_none() {
            tracing::warn!(channel = %id, "write for channel outside of batch ignored");
        }

        state
    }
}
