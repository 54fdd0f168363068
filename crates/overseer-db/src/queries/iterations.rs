//! Database query functions for the `iterations` table.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::models::{HistoryFilter, HistoryPage, HistoryStats, IterationRecord, NewIterationRecord};

/// Timestamps are written with a fixed width so that text ordering in
/// SQLite matches chronological ordering.
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Append an iteration row. Returns the stored row with its assigned id.
pub async fn insert_iteration(
    pool: &SqlitePool,
    new: &NewIterationRecord,
) -> Result<IterationRecord> {
    let record = sqlx::query_as::<_, IterationRecord>(
        "INSERT INTO iterations (\
             iteration_number, performer_name, performer_emoji, result, \
             tasks_before, tasks_after, duration_seconds, \
             started_at, ended_at, error_message\
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.iteration_number)
    .bind(&new.performer_name)
    .bind(&new.performer_emoji)
    .bind(new.result)
    .bind(new.tasks_before)
    .bind(new.tasks_after)
    .bind(new.duration_seconds)
    .bind(encode_timestamp(&new.started_at))
    .bind(encode_timestamp(&new.ended_at))
    .bind(&new.error_message)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert iteration {} ({}) result {}",
            new.iteration_number, new.performer_name, new.result
        )
    })?;

    Ok(record)
}

/// Fetch a single iteration by id.
pub async fn get_iteration(pool: &SqlitePool, id: i64) -> Result<Option<IterationRecord>> {
    let record = sqlx::query_as::<_, IterationRecord>("SELECT * FROM iterations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to get iteration {id}"))?;

    Ok(record)
}

fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a HistoryFilter) {
    let mut separator = " WHERE ";
    if let Some(result) = filter.result {
        builder.push(separator).push("result = ").push_bind(result);
        separator = " AND ";
    }
    if let Some(performer) = filter.performer.as_deref() {
        builder.push(separator).push("performer_name = ").push_bind(performer);
    }
}

/// List iterations matching `filter`, most recently ended first.
///
/// The count and the page are read inside one transaction so `total`
/// and `records` describe the same snapshot of the ledger.
pub async fn list_iterations(
    pool: &SqlitePool,
    filter: &HistoryFilter,
    limit: i64,
    offset: i64,
) -> Result<HistoryPage> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin history read")?;

    let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM iterations");
    push_filters(&mut count_query, filter);
    let total: i64 = count_query
        .build_query_scalar::<i64>()
        .fetch_one(&mut *tx)
        .await
        .context("failed to count iterations")?;

    let mut page_query = QueryBuilder::<Sqlite>::new("SELECT * FROM iterations");
    push_filters(&mut page_query, filter);
    page_query
        .push(" ORDER BY ended_at DESC, id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);
    let records = page_query
        .build_query_as::<IterationRecord>()
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("failed to list iterations (limit {limit}, offset {offset})"))?;

    tx.commit().await.context("failed to finish history read")?;

    let has_more = offset + (records.len() as i64) < total;
    Ok(HistoryPage {
        records,
        total,
        has_more,
    })
}

/// Aggregate counts by result and the mean duration over every row.
pub async fn iteration_stats(pool: &SqlitePool) -> Result<HistoryStats> {
    let stats = sqlx::query_as::<_, HistoryStats>(
        "SELECT \
             COUNT(*) AS total, \
             COALESCE(SUM(CASE WHEN result = 'success' THEN 1 ELSE 0 END), 0) AS success_count, \
             COALESCE(SUM(CASE WHEN result = 'no_progress' THEN 1 ELSE 0 END), 0) AS no_progress_count, \
             COALESCE(SUM(CASE WHEN result = 'error' THEN 1 ELSE 0 END), 0) AS error_count, \
             COALESCE(SUM(CASE WHEN result = 'rate_limited' THEN 1 ELSE 0 END), 0) AS rate_limited_count, \
             COALESCE(SUM(CASE WHEN result = 'cancelled' THEN 1 ELSE 0 END), 0) AS cancelled_count, \
             CAST(COALESCE(AVG(duration_seconds), 0.0) AS REAL) AS avg_duration_seconds \
         FROM iterations",
    )
    .fetch_one(pool)
    .await
    .context("failed to compute iteration stats")?;

    Ok(stats)
}

/// Every performer name that appears in the ledger, sorted.
pub async fn distinct_performers(pool: &SqlitePool) -> Result<Vec<String>> {
    let names: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT performer_name FROM iterations ORDER BY performer_name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list performers")?;

    Ok(names)
}

/// Number of rows in the ledger.
pub async fn count_iterations(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM iterations")
        .fetch_one(pool)
        .await
        .context("failed to count iterations")?;

    Ok(row.0)
}
