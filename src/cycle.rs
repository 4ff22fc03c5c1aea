use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::instrument;
use uuid::Uuid;

use crate::db::prelude::*;
use crate::overlap::pairs::pair_count;
use crate::overlap::{ChannelId, ChannelOverlap, ChannelRecord, OverlapEngine, OverlapError};
use crate::util::chatters::{ChatterSource, FetchLimits, collect_records};
use crate::util::env::Config;
use crate::util::helix::{ChannelDirectory, HelixErr};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub min_viewers: u32,
    pub fetch: FetchLimits,
    pub workers: NonZeroUsize,
    pub engine_deadline: Option<Duration>,
    pub retention: chrono::Duration,
}

impl CycleSettings {
    pub fn new(config: &Config) -> Self {
        Self {
            min_viewers: config.min_viewers,
            fetch: FetchLimits::new(config),
            workers: config.workers(),
            engine_deadline: config.engine_deadline(),
            retention: config.retention(),
        }
    }
}

/// What a completed cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub timestamp: NaiveDateTime,
    pub discovered: usize,
    pub channels: usize,
    pub pairs: usize,
    pub summary: CycleSummary,
}

/// Runs collection cycles against a set of collaborators.
pub struct Collector {
    directory: Arc<dyn ChannelDirectory>,
    chatters: Arc<dyn ChatterSource>,
    store: Arc<dyn OverlapStore>,
    settings: CycleSettings,
}

impl Collector {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        chatters: Arc<dyn ChatterSource>,
        store: Arc<dyn OverlapStore>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            directory,
            chatters,
            store,
            settings,
        }
    }

    /// Samples the current top channels, computes their overlaps and persists the result.
    ///
    /// Individual channels that fail chatter retrieval are dropped. Any other failure aborts the
    /// cycle before anything is written.
    #[instrument(skip(self), fields(cycle_id = %Uuid::new_v4()))]
    pub async fn run_cycle(&self) -> CycleResult<CycleReport> {
        let timestamp = Utc::now().naive_utc();
        let mut stopwatch = Instant::now();

        let mut discovered = self
            .directory
            .fetch_top_streams(self.settings.min_viewers)
            .await?;
        let discovered_count = discovered.len();

        let logins: Vec<ChannelId> = discovered.iter().map(|c| c.id.clone()).collect();
        match self.directory.fetch_avatars(&logins).await {
            Ok(avatars) => discovered.iter_mut().for_each(|channel| {
                channel.meta.avatar = avatars.get(&channel.id).cloned();
            }),
            Err(e) => tracing::warn!(error = %e, "avatar enrichment failed, continuing without"),
        }

        tracing::info!(
            channels = discovered_count,
            elapsed_ms = stopwatch.elapsed().as_millis() as u64,
            "retrieved channels"
        );
        stopwatch = Instant::now();

        let records = collect_records(&*self.chatters, discovered, &self.settings.fetch).await;
        tracing::info!(
            channels = records.len(),
            excluded = discovered_count - records.len(),
            elapsed_ms = stopwatch.elapsed().as_millis() as u64,
            "retrieved chatters"
        );
        stopwatch = Instant::now();

        let pairs = pair_count(records.len());
        let mut engine = OverlapEngine::new(self.settings.workers);
        if let Some(deadline) = self.settings.engine_deadline {
            engine = engine.with_deadline(Instant::now() + deadline);
        }

        let (records, results) = tokio::task::spawn_blocking(move || {
            let results = engine.compute(&records);
            (records, results)
        })
        .await?;
        let results = results?;

        tracing::info!(
            pairs,
            elapsed_ms = stopwatch.elapsed().as_millis() as u64,
            "calculated intersection"
        );
        stopwatch = Instant::now();

        let batch = assemble_batch(timestamp, &records, &results, self.settings.retention);
        let summary = self.store.commit_cycle(&batch).await?;

        tracing::info!(
            upserted = summary.upserted,
            appended = summary.appended,
            pruned = summary.pruned,
            elapsed_ms = stopwatch.elapsed().as_millis() as u64,
            "persisted cycle"
        );

        Ok(CycleReport {
            timestamp,
            discovered: discovered_count,
            channels: records.len(),
            pairs,
            summary,
        })
    }

    /// Runs a cycle every `period` until `shutdown` resolves, and returns its output.
    ///
    /// `shutdown` is polled for the whole run, including while a cycle is in flight; such a
    /// cycle is dropped before it commits. A failed cycle is logged and the next tick proceeds.
    pub async fn run_scheduled<S>(&self, period: Duration, shutdown: S) -> S::Output
    where
        S: Future,
    {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => (),
                signal = &mut shutdown => return signal,
            }

            tokio::select! {
                outcome = self.run_cycle() => match outcome {
                    Ok(report) => tracing::info!(?report, "cycle complete"),
                    Err(e) => tracing::error!(error = %e, "cycle failed, waiting for next tick"),
                },
                signal = &mut shutdown => {
                    tracing::warn!("shutdown during cycle, abandoning it");
                    return signal;
                }
            }
        }
    }
}

/// Turns engine output into the snapshot upserts and overlap records for one cycle.
pub fn assemble_batch(
    timestamp: NaiveDateTime,
    records: &[ChannelRecord],
    results: &HashMap<ChannelId, ChannelOverlap>,
    retention: chrono::Duration,
) -> CycleBatch {
    let empty = ChannelOverlap::default();
    let mut snapshots = Vec::with_capacity(records.len());
    let mut overlaps = Vec::with_capacity(records.len());

    for record in records {
        let overlap = results.get(&record.id).unwrap_or(&empty);
        snapshots.push(ChannelSnapshot::new(record, overlap, timestamp));
        overlaps.push(OverlapRecord::new(record.id.clone(), overlap, timestamp));
    }

    CycleBatch {
        timestamp,
        snapshots,
        records: overlaps,
        prune_before: timestamp - retention,
    }
}

pub type CycleResult<T> = core::result::Result<T, CycleError>;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("channel discovery failed: {0}")]
    Discovery(#[from] HelixErr),

    #[error("overlap computation failed: {0}")]
    Overlap(#[from] OverlapError),

    #[error("overlap worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("persisting cycle failed: {0}")]
    Store(#[from] StoreError),
}
