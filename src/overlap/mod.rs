//! Pairwise audience overlap between the channels of a single batch.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

pub mod accumulator;
pub mod identity;
pub mod pairs;
pub mod record;

use accumulator::OverlapAccumulator;
use pairs::{Pairs, pair_count};
pub use identity::IdentitySet;
pub use record::{ChannelId, ChannelMeta, ChannelRecord};

/// Pairs buffered per worker between the producer and the pool.
const QUEUE_DEPTH_PER_WORKER: usize = 64;

/// Finished overlap figures for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelOverlap {
    /// Number of other channels sharing at least one chatter.
    pub total_distinct_overlap: usize,
    /// `peer -> shared chatter count`, nonzero entries only.
    pub shared_counts: BTreeMap<ChannelId, usize>,
}

#[derive(Debug, Clone)]
pub struct OverlapEngine {
    workers: NonZeroUsize,
    deadline: Option<Instant>,
}

impl Default for OverlapEngine {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN))
    }
}

impl OverlapEngine {
    pub fn new(workers: NonZeroUsize) -> Self {
        Self {
            workers,
            deadline: None,
        }
    }

    /// Stop submitting pairs once `deadline` passes; the batch then fails as a whole.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers.get()
    }

    /// Computes overlap figures for every channel in `channels`.
    ///
    /// Pairs are produced from a single generator on the calling thread and drained by a pool of
    /// scoped workers through a bounded queue. Results are only returned once every pair has been
    /// evaluated.
    #[instrument(skip(self, channels), fields(channels = channels.len(), workers = self.workers()))]
    pub fn compute(
        &self,
        channels: &[ChannelRecord],
    ) -> OverlapResult<HashMap<ChannelId, ChannelOverlap>> {
        let mut sorted: Vec<&ChannelRecord> = channels.iter().collect();
        sorted.sort_unstable_by(|a, b| a.id.cmp(&b.id));

        if let Some(dup) = sorted.windows(2).find(|w| w[0].id == w[1].id) {
            tracing::error!(channel = %dup[0].id, "duplicate channel in batch");
            return Err(OverlapError::DuplicateChannel(dup[0].id.clone()));
        }

        let acc = OverlapAccumulator::new(sorted.iter().map(|record| &record.id));
        let total = pair_count(sorted.len());
        if total > 0 {
            self.drain_pairs(&sorted, &acc, total)?;
        }

        let results: HashMap<_, _> = acc
            .ids()
            .map(|id| {
                let overlap = ChannelOverlap {
                    total_distinct_overlap: acc.total_distinct_overlap(id),
                    shared_counts: acc.shared_counts(id),
                };

                (id.clone(), overlap)
            })
            .collect();

        tracing::debug!(pairs = total, "overlap computation complete");
        Ok(results)
    }

    fn drain_pairs(
        &self,
        sorted: &[&ChannelRecord],
        acc: &OverlapAccumulator,
        total: usize,
    ) -> OverlapResult<()> {
        let workers = self.workers.get().min(total);
        let (tx, rx) = async_channel::bounded(workers * QUEUE_DEPTH_PER_WORKER);
        let panicked = AtomicBool::new(false);

        let submitted = std::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                let panicked = &panicked;
                scope.spawn(move || {
                    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        while let Ok((a, b)) = rx.recv_blocking() {
                            evaluate_pair(a, b, acc);
                        }
                    }));

                    if outcome.is_err() {
                        panicked.store(true, Ordering::SeqCst);
                        // stop the producer; the batch is lost anyway
                        rx.close();
                    }
                });
            }
            drop(rx);

            let mut submitted = 0usize;
            for pair in Pairs::new(sorted) {
                if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    tracing::warn!(submitted, total, "deadline reached, abandoning batch");
                    break;
                }

                if tx.send_blocking(pair).is_err() {
                    break;
                }
                submitted += 1;
            }

            tx.close();
            submitted
        });

        if panicked.load(Ordering::SeqCst) {
            return Err(OverlapError::WorkerPanicked);
        }

        if submitted < total {
            return Err(OverlapError::DeadlineExceeded { submitted, total });
        }

        Ok(())
    }
}

/// Identity that makes [`evaluate_pair`] panic, for exercising worker failure.
#[cfg(test)]
const PANIC_IDENTITY: &str = "worker-panic-trigger";

/// Intersects the two channels' sets, probing the larger set with members of the smaller one.
fn evaluate_pair(a: &ChannelRecord, b: &ChannelRecord, acc: &OverlapAccumulator) {
    #[cfg(test)]
    if a.identities.contains(PANIC_IDENTITY) || b.identities.contains(PANIC_IDENTITY) {
        panic!("pair ({}, {}) carries the panic trigger", a.id, b.id);
    }

    let (small, large) = if a.identities.len() <= b.identities.len() {
        (&a.identities, &b.identities)
    } else {
        (&b.identities, &a.identities)
    };

    let mut shared = 0usize;
    for identity in small {
        if large.contains(identity) {
            acc.mark_overlapping(&a.id, &b.id);
            shared += 1;
        }
    }

    acc.record_shared_count(&a.id, &b.id, shared);
}

pub type OverlapResult<T> = core::result::Result<T, OverlapError>;

#[derive(Debug, Error)]
pub enum OverlapError {
    #[error("channel '{0}' appears more than once in the batch")]
    DuplicateChannel(ChannelId),

    #[error("deadline reached after submitting {submitted} of {total} pairs")]
    DeadlineExceeded { submitted: usize, total: usize },

    #[error("overlap worker panicked")]
    WorkerPanicked,
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::time::Duration;

    use rand::Rng;
    use rand::seq::IndexedRandom;

    use super::*;

    fn channel(id: &str, chatters: &[&str]) -> ChannelRecord {
        let raw: Vec<Option<&str>> = chatters.iter().map(|&c| Some(c)).collect();
        let identities = IdentitySet::build(raw, u32::MAX, 0).unwrap();
        ChannelRecord::new(id, ChannelMeta::default(), identities)
    }

    fn engine(workers: usize) -> OverlapEngine {
        OverlapEngine::new(NonZeroUsize::new(workers).unwrap())
    }

    fn random_batch(n: usize, pool: usize, max_size: usize) -> Vec<ChannelRecord> {
        let mut rng = rand::rng();
        let population: Vec<String> = (0..pool).map(|i| format!("viewer{i}")).collect();

        (0..n)
            .map(|i| {
                let size = rng.random_range(0..=max_size);
                let chatters: Vec<&str> = population
                    .choose_multiple(&mut rng, size)
                    .map(String::as_str)
                    .collect();
                channel(&format!("channel{i:03}"), &chatters)
            })
            .collect()
    }

    #[test]
    fn test_three_channel_scenario() {
        let batch = vec![
            channel("a", &["x", "y", "z"]),
            channel("b", &["y", "z", "w"]),
            channel("c", &["q"]),
        ];

        let results = engine(4).compute(&batch).unwrap();
        let (a, b, c) = (ChannelId::from("a"), ChannelId::from("b"), ChannelId::from("c"));

        assert_eq!(results[&a].shared_counts.get(&b), Some(&2));
        assert_eq!(results[&b].shared_counts.get(&a), Some(&2));
        assert_eq!(results[&a].shared_counts.get(&c), None);
        assert_eq!(results[&b].shared_counts.get(&c), None);

        assert_eq!(results[&a].total_distinct_overlap, 1);
        assert_eq!(results[&b].total_distinct_overlap, 1);
        assert_eq!(results[&c].total_distinct_overlap, 0);
        assert!(results[&c].shared_counts.is_empty());
    }

    #[test]
    fn test_empty_and_single_batches() {
        assert!(engine(2).compute(&[]).unwrap().is_empty());

        let results = engine(2).compute(&[channel("solo", &["x"])]).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[&ChannelId::from("solo")], ChannelOverlap::default());
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let batch = vec![
            channel("a", &["x"]),
            channel("b", &["x"]),
            channel("A", &["y"]),
        ];

        match engine(2).compute(&batch) {
            Err(OverlapError::DuplicateChannel(id)) => assert_eq!(id, ChannelId::from("a")),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_detected_for_deserialized_id() {
        let decoded: ChannelId = serde_json::from_str(r#""B""#).unwrap();
        let batch = vec![
            channel("b", &["x"]),
            ChannelRecord::new(decoded, ChannelMeta::default(), IdentitySet::default()),
        ];

        match engine(2).compute(&batch) {
            Err(OverlapError::DuplicateChannel(id)) => assert_eq!(id, ChannelId::from("b")),
            other => panic!("expected duplicate error, got {other:?}"),
        }
    }

    #[test]
    fn test_worker_panic_fails_batch() {
        for workers in [1, 4] {
            let mut batch = random_batch(20, 100, 30);
            batch.push(channel("zzz-broken", &[PANIC_IDENTITY, "viewer1"]));

            // run off-thread so a stuck producer shows up as a timeout instead of a hung test
            let (tx, rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let _ = tx.send(engine(workers).compute(&batch));
            });

            match rx.recv_timeout(Duration::from_secs(10)) {
                Ok(Err(OverlapError::WorkerPanicked)) => (),
                Ok(other) => panic!("expected worker panic error with {workers} workers, got {other:?}"),
                Err(_) => panic!("compute did not return with {workers} workers"),
            }
        }
    }

    #[test]
    fn test_matches_brute_force() {
        let batch = random_batch(40, 300, 120);
        let results = engine(8).compute(&batch).unwrap();

        for a in &batch {
            let mut peers = HashSet::new();
            for b in batch.iter().filter(|b| b.id != a.id) {
                let expected = a
                    .identities
                    .iter()
                    .filter(|i| b.identities.contains(i))
                    .count();

                let forward = results[&a.id].shared_counts.get(&b.id).copied();
                let backward = results[&b.id].shared_counts.get(&a.id).copied();
                assert_eq!(forward, backward);
                assert_eq!(forward.unwrap_or(0), expected);

                if expected > 0 {
                    peers.insert(b.id.clone());
                }
            }

            assert_eq!(results[&a.id].total_distinct_overlap, peers.len());
        }
    }

    #[test]
    fn test_worker_count_does_not_change_result() {
        let batch = random_batch(30, 200, 80);

        let single = engine(1).compute(&batch).unwrap();
        let many = engine(16).compute(&batch).unwrap();
        assert_eq!(single, many);

        let mut reversed = batch.clone();
        reversed.reverse();
        assert_eq!(engine(3).compute(&reversed).unwrap(), single);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let batch = random_batch(20, 100, 50);
        let engine = engine(4);

        let first = engine.compute(&batch).unwrap();
        let second = engine.compute(&batch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_expired_deadline_discards_batch() {
        let batch = random_batch(10, 50, 20);
        let engine = engine(2).with_deadline(Instant::now() - Duration::from_secs(1));

        match engine.compute(&batch) {
            Err(OverlapError::DeadlineExceeded { submitted, total }) => {
                assert_eq!(submitted, 0);
                assert_eq!(total, pair_count(10));
            }
            other => panic!("expected deadline error, got {other:?}"),
        }
    }

    #[test]
    fn test_deadline_irrelevant_without_pairs() {
        let engine = engine(2).with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(engine.compute(&[channel("solo", &["x"])]).is_ok());
    }

    #[test]
    fn test_disjoint_channels_have_no_overlap() {
        let batch: Vec<_> = (0..12)
            .map(|i| {
                let name = format!("only{i}");
                channel(&format!("c{i}"), &[name.as_str()])
            })
            .collect();

        let results = engine(4).compute(&batch).unwrap();
        assert!(results.values().all(|r| *r == ChannelOverlap::default()));
    }
}
