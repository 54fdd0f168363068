//! `overseer history` and `overseer stats`: read the iteration ledger.

use anyhow::Result;

use overseer_db::HistoryStore;
use overseer_db::models::{HistoryFilter, HistoryStats, IterationRecord, IterationResult};

/// Run the history command.
pub async fn run_history(
    store: &HistoryStore,
    filter: &HistoryFilter,
    limit: i64,
    offset: i64,
) -> Result<()> {
    let page = store.query(filter, limit, offset).await?;

    if page.records.is_empty() {
        println!("No iterations recorded.");
        return Ok(());
    }

    println!(
        "Iterations {}-{} of {}:",
        offset.max(0) + 1,
        offset.max(0) + page.records.len() as i64,
        page.total
    );
    for record in &page.records {
        println!("  {}", format_record(record));
    }
    if page.has_more {
        println!("  ... more available (use --offset)");
    }

    Ok(())
}

/// Run the stats command.
pub async fn run_stats(store: &HistoryStore) -> Result<()> {
    let stats = store.stats().await?;
    print!("{}", format_stats(&stats));

    let performers = store.distinct_performers().await?;
    if !performers.is_empty() {
        println!("Performers: {}", performers.join(", "));
    }
    Ok(())
}

/// One-line summary of a ledger record.
pub fn format_record(record: &IterationRecord) -> String {
    let mut line = format!(
        "[{ended}] #{n} {emoji} {performer}: {result} (pending {before} -> {after}, {duration})",
        ended = record.ended_at.format("%Y-%m-%d %H:%M:%S"),
        n = record.iteration_number,
        emoji = record.performer_emoji,
        performer = record.performer_name,
        result = record.result,
        before = record.tasks_before,
        after = record.tasks_after,
        duration = format_duration(record.duration_seconds),
    );
    if let Some(message) = &record.error_message {
        line.push_str(&format!(" - {message}"));
    }
    line
}

pub fn format_stats(stats: &HistoryStats) -> String {
    let mut out = format!("Total iterations: {}\n", stats.total);
    for result in IterationResult::ALL {
        out.push_str(&format!(
            "  {:<13}{}\n",
            result.as_str(),
            stats.count_for(result)
        ));
    }
    out.push_str(&format!(
        "Average duration: {}\n",
        format_duration(stats.avg_duration_seconds)
    ));
    out
}

/// Render seconds as `1h 02m 03s`, `4m 05s` or `12s`.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn sample_record() -> IterationRecord {
        IterationRecord {
            id: 7,
            iteration_number: 3,
            performer_name: "cleanup".to_string(),
            performer_emoji: "🧹".to_string(),
            result: IterationResult::Error,
            tasks_before: 5,
            tasks_after: 5,
            duration_seconds: 125.4,
            started_at: Utc.with_ymd_and_hms(2025, 3, 1, 8, 58, 0).unwrap(),
            ended_at: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 5).unwrap(),
            error_message: Some("tool crashed".to_string()),
        }
    }

    #[test]
    fn durations_pick_the_largest_unit() {
        assert_eq!(format_duration(0.0), "0s");
        assert_eq!(format_duration(12.4), "12s");
        assert_eq!(format_duration(245.0), "4m 05s");
        assert_eq!(format_duration(3723.0), "1h 02m 03s");
        assert_eq!(format_duration(-3.0), "0s");
    }

    #[test]
    fn record_line_includes_result_counts_and_message() {
        let line = format_record(&sample_record());
        assert_eq!(
            line,
            "[2025-03-01 09:00:05] #3 🧹 cleanup: error (pending 5 -> 5, 2m 05s) - tool crashed"
        );
    }

    #[test]
    fn stats_list_every_result_bucket() {
        let stats = HistoryStats {
            total: 4,
            success_count: 2,
            no_progress_count: 1,
            error_count: 0,
            rate_limited_count: 0,
            cancelled_count: 1,
            avg_duration_seconds: 90.0,
        };
        let out = format_stats(&stats);
        assert!(out.starts_with("Total iterations: 4\n"));
        assert!(out.contains("  success      2\n"));
        assert!(out.contains("  no_progress  1\n"));
        assert!(out.contains("  cancelled    1\n"));
        assert!(out.ends_with("Average duration: 1m 30s\n"));
    }
}
