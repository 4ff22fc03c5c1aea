use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;

use crate::overlap::ChannelId;

pub mod memory;
pub mod models;
pub mod repositories;

pub mod prelude {
    pub use crate::db::memory::MemoryStore;
    pub use crate::db::models::channel::ChannelSnapshot;
    pub use crate::db::models::overlap::OverlapRecord;
    pub use crate::db::models::{CycleBatch, CycleSummary};
    pub use crate::db::repositories::overlap::PgOverlapStore;
    pub use crate::db::{OverlapStore, StoreError};
}

/// Persistence port for finished cycles.
///
/// Implementations apply a [`CycleBatch`](models::CycleBatch) atomically: every snapshot upsert,
/// every overlap record append and the retention prune land together, or none of them do.
#[async_trait]
pub trait OverlapStore: Send + Sync {
    async fn commit_cycle(&self, batch: &models::CycleBatch) -> StoreResult<models::CycleSummary>;
}

/// Connects to postgres and makes sure the tables exist.
#[instrument(skip(database_url))]
pub async fn connect(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPool::connect(database_url).await?;
    sqlx::raw_sql(repositories::sql_fragment::SCHEMA)
        .execute(&pool)
        .await?;

    tracing::debug!("database connected, schema ensured");
    Ok(pool)
}

pub type StoreResult<T> = core::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),

    #[error("overlap record for unknown channel '{0}'")]
    UnknownChannel(ChannelId),
}
