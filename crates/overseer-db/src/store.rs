//! The History Store handle shared by the supervisor and the control API.

use anyhow::{Result, bail};
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::DbConfig;
use crate::models::{HistoryFilter, HistoryPage, HistoryStats, IterationRecord, NewIterationRecord};
use crate::pool;
use crate::queries::iterations;

/// Page size used when a caller does not ask for one.
pub const DEFAULT_PAGE_SIZE: i64 = 50;

/// Largest page a single query may return.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Append-only ledger of completed iterations.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) and migrate the database named by `config`.
    pub async fn open(config: &DbConfig) -> Result<Self> {
        let pool = pool::connect_and_migrate(config).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Durably append a completed iteration.
    ///
    /// Rejects records whose end precedes their start instead of storing
    /// them.
    pub async fn append(&self, record: &NewIterationRecord) -> Result<IterationRecord> {
        if record.ended_at < record.started_at {
            bail!(
                "iteration {} ends ({}) before it starts ({})",
                record.iteration_number,
                record.ended_at,
                record.started_at
            );
        }
        let stored = iterations::insert_iteration(&self.pool, record).await?;
        debug!(
            id = stored.id,
            iteration = stored.iteration_number,
            result = %stored.result,
            "iteration appended to history"
        );
        Ok(stored)
    }

    /// Filtered, paginated history, newest `ended_at` first.
    ///
    /// `limit` is clamped to `1..=MAX_PAGE_SIZE`; a negative `offset` is
    /// treated as zero.
    pub async fn query(
        &self,
        filter: &HistoryFilter,
        limit: i64,
        offset: i64,
    ) -> Result<HistoryPage> {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let offset = offset.max(0);
        iterations::list_iterations(&self.pool, filter, limit, offset).await
    }

    /// Aggregate counts by result and mean duration over the full ledger.
    pub async fn stats(&self) -> Result<HistoryStats> {
        iterations::iteration_stats(&self.pool).await
    }

    /// Performer names seen across all records.
    pub async fn distinct_performers(&self) -> Result<Vec<String>> {
        iterations::distinct_performers(&self.pool).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<IterationRecord>> {
        iterations::get_iteration(&self.pool, id).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
