use chrono::NaiveDateTime;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Result as SqlxResult, Transaction};
use tracing::instrument;

use crate::db::models::channel::ChannelSnapshot;
use crate::db::models::overlap::OverlapRecord;

pub mod overlap;

/// Thin wrapper over a postgres transaction carrying the cycle's write operations.
pub struct Tx<'a> {
    inner: Option<Transaction<'a, Postgres>>,
}

impl<'a> Tx<'a> {
    #[instrument(skip(pool))]
    pub async fn begin(pool: &PgPool) -> SqlxResult<Tx<'static>> {
        let inner = pool.begin().await?;
        Ok(Tx { inner: Some(inner) })
    }

    #[instrument(skip(self))]
    pub async fn commit(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.commit().await
        } else {
            Err(sqlx::Error::Protocol(
                "Transaction already completed".into(),
            ))
        }
    }

    #[instrument(skip(self))]
    pub async fn rollback(&mut self) -> SqlxResult<()> {
        if let Some(tx) = self.inner.take() {
            tx.rollback().await
        } else {
            Err(sqlx::Error::Protocol(
                "Transaction already completed".into(),
            ))
        }
    }

    fn inner_mut(&mut self) -> SqlxResult<&mut Transaction<'a, Postgres>> {
        self.inner
            .as_mut()
            .ok_or_else(|| sqlx::Error::Protocol("Transaction already completed".into()))
    }

    #[instrument(skip(self, item), fields(channel = %item.id))]
    pub async fn upsert_channel_snapshot(&mut self, item: &ChannelSnapshot) -> SqlxResult<u64> {
        let res = sqlx::query(
            r#"
            INSERT INTO channel (
                id,
                display_name,
                avatar,
                game,
                viewers,
                chatters,
                shared,
                last_update
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id)
            DO UPDATE SET
                display_name = EXCLUDED.display_name,
                avatar = COALESCE(EXCLUDED.avatar, channel.avatar),
                game = EXCLUDED.game,
                viewers = EXCLUDED.viewers,
                chatters = EXCLUDED.chatters,
                shared = EXCLUDED.shared,
                last_update = EXCLUDED.last_update
            "#,
        )
        .bind(&item.id)
        .bind(&item.display_name)
        .bind(&item.avatar)
        .bind(&item.game)
        .bind(item.viewers)
        .bind(item.chatters)
        .bind(item.shared)
        .bind(item.last_update)
        .execute(&mut **self.inner_mut()?)
        .await?;

        Ok(res.rows_affected())
    }

    #[instrument(skip(self, item), fields(channel = %item.channel, peers = item.shared.len()))]
    pub async fn append_overlap_record(&mut self, item: &OverlapRecord) -> SqlxResult<u64> {
        let res = sqlx::query(
            r#"
            INSERT INTO overlap (
                channel,
                timestamp,
                shared
            )
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&item.channel)
        .bind(item.timestamp)
        .bind(Json(&item.shared))
        .execute(&mut **self.inner_mut()?)
        .await?;

        Ok(res.rows_affected())
    }

    #[instrument(skip(self))]
    pub async fn prune_overlap_records_before(&mut self, cutoff: NaiveDateTime) -> SqlxResult<u64> {
        let res = sqlx::query("DELETE FROM overlap WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&mut **self.inner_mut()?)
            .await?;

        tracing::debug!(pruned = res.rows_affected(), "pruned expired overlap records");
        Ok(res.rows_affected())
    }
}

pub mod sql_fragment {
    pub const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS channel (
            id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            avatar TEXT,
            game TEXT NOT NULL,
            viewers INTEGER NOT NULL,
            chatters INTEGER NOT NULL,
            shared INTEGER NOT NULL,
            last_update TIMESTAMP NOT NULL
        );

        CREATE TABLE IF NOT EXISTS overlap (
            id BIGSERIAL PRIMARY KEY,
            channel TEXT NOT NULL REFERENCES channel (id) ON DELETE CASCADE,
            timestamp TIMESTAMP NOT NULL,
            shared JSONB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS overlap_timestamp_idx ON overlap (timestamp);
        CREATE INDEX IF NOT EXISTS overlap_channel_timestamp_idx ON overlap (channel, timestamp DESC);
    "#;
}
