use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum IterationResult {
    Success,
    NoProgress,
    Error,
    RateLimited,
    Cancelled,
}

impl IterationResult {
    /// Every variant, in display order.
    pub const ALL: [IterationResult; 5] = [
        Self::Success,
        Self::NoProgress,
        Self::Error,
        Self::RateLimited,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoProgress => "no_progress",
            Self::Error => "error",
            Self::RateLimited => "rate_limited",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for IterationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IterationResult {
    type Err = IterationResultParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "no_progress" => Ok(Self::NoProgress),
            "error" => Ok(Self::Error),
            "rate_limited" => Ok(Self::RateLimited),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(IterationResultParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`IterationResult`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid iteration result: {0:?}")]
pub struct IterationResultParseError(pub String);

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A completed iteration, as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IterationRecord {
    pub id: i64,
    pub iteration_number: i64,
    pub performer_name: String,
    pub performer_emoji: String,
    pub result: IterationResult,
    pub tasks_before: i64,
    pub tasks_after: i64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Parameters for appending an iteration. The ledger assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIterationRecord {
    pub iteration_number: i64,
    pub performer_name: String,
    pub performer_emoji: String,
    pub result: IterationResult,
    pub tasks_before: i64,
    pub tasks_after: i64,
    pub duration_seconds: f64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// Query shapes
// ---------------------------------------------------------------------------

/// Optional filters for history queries. `None` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    pub result: Option<IterationResult>,
    pub performer: Option<String>,
}

/// One page of history, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub records: Vec<IterationRecord>,
    /// Number of records matching the filter, ignoring pagination.
    pub total: i64,
    pub has_more: bool,
}

/// Aggregate statistics over the whole ledger.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct HistoryStats {
    pub total: i64,
    pub success_count: i64,
    pub no_progress_count: i64,
    pub error_count: i64,
    pub rate_limited_count: i64,
    pub cancelled_count: i64,
    pub avg_duration_seconds: f64,
}

impl HistoryStats {
    /// Count for a single result bucket.
    pub fn count_for(&self, result: IterationResult) -> i64 {
        match result {
            IterationResult::Success => self.success_count,
            IterationResult::NoProgress => self.no_progress_count,
            IterationResult::Error => self.error_count,
            IterationResult::RateLimited => self.rate_limited_count,
            IterationResult::Cancelled => self.cancelled_count,
        }
    }
}
