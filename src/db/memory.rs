use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::db::models::channel::ChannelSnapshot;
use crate::db::models::overlap::OverlapRecord;
use crate::db::models::{CycleBatch, CycleSummary};
use crate::db::{OverlapStore, StoreError, StoreResult};
use crate::overlap::ChannelId;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub channels: BTreeMap<ChannelId, ChannelSnapshot>,
    pub overlaps: Vec<OverlapRecord>,
}

impl MemoryState {
    fn upsert_channel_snapshot(&mut self, item: &ChannelSnapshot) -> u64 {
        let mut item = item.clone();
        if item.avatar.is_none()
            && let Some(existing) = self.channels.get(&item.id)
        {
            item.avatar = existing.avatar.clone();
        }

        self.channels.insert(item.id.clone(), item);
        1
    }

    fn append_overlap_record(&mut self, item: &OverlapRecord) -> StoreResult<u64> {
        if !self.channels.contains_key(&item.channel) {
            return Err(StoreError::UnknownChannel(item.channel.clone()));
        }

        self.overlaps.push(item.clone());
        Ok(1)
    }

    fn prune_overlap_records_before(&mut self, cutoff: NaiveDateTime) -> u64 {
        let before = self.overlaps.len();
        self.overlaps.retain(|record| record.timestamp >= cutoff);
        (before - self.overlaps.len()) as u64
    }
}

/// Process-local store used for dry runs.
///
/// Writes for a cycle are staged on a copy of the state and swapped in only once every write
/// succeeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.state.read().await.clone()
    }
}

#[async_trait]
impl OverlapStore for MemoryStore {
    #[instrument(skip(self, batch), fields(snapshots = batch.snapshots.len(), records = batch.records.len()))]
    async fn commit_cycle(&self, batch: &CycleBatch) -> StoreResult<CycleSummary> {
        let mut state = self.state.write().await;
        let mut staged = state.clone();
        let mut summary = CycleSummary::default();

        for snapshot in &batch.snapshots {
            summary.upserted += staged.upsert_channel_snapshot(snapshot);
        }

        for record in &batch.records {
            summary.appended += staged.append_overlap_record(record)?;
        }

        summary.pruned = staged.prune_overlap_records_before(batch.prune_before);

        *state = staged;
        Ok(summary)
    }
}
