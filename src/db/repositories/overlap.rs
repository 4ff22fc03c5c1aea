use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use super::Tx;
use crate::db::models::{CycleBatch, CycleSummary};
use crate::db::{OverlapStore, StoreResult};

#[derive(Debug, Clone)]
pub struct PgOverlapStore {
    pool: PgPool,
}

impl PgOverlapStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_all(tx: &mut Tx<'_>, batch: &CycleBatch) -> StoreResult<CycleSummary> {
        let mut summary = CycleSummary::default();

        for snapshot in &batch.snapshots {
            summary.upserted += tx.upsert_channel_snapshot(snapshot).await?;
        }

        for record in &batch.records {
            summary.appended += tx.append_overlap_record(record).await?;
        }

        summary.pruned = tx.prune_overlap_records_before(batch.prune_before).await?;
        Ok(summary)
    }
}

#[async_trait]
impl OverlapStore for PgOverlapStore {
    #[instrument(skip(self, batch), fields(snapshots = batch.snapshots.len(), records = batch.records.len()))]
    async fn commit_cycle(&self, batch: &CycleBatch) -> StoreResult<CycleSummary> {
        let mut tx = Tx::begin(&self.pool).await?;

        match Self::write_all(&mut tx, batch).await {
            Ok(summary) => {
                tx.commit().await?;
                Ok(summary)
            }
            Err(e) => {
                tracing::error!(error = ?e, "cycle write failure, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(error = ?rollback_err, "rollback failure");
                }
                Err(e)
            }
        }
    }
}
