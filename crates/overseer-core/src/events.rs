//! Structured events emitted by the agent on stdout.
//!
//! An agent running in JSON-events mode writes one JSON object per line,
//! discriminated by an `event` field. Fields the supervisor does not use
//! (such as the agent's own `timestamp`) are ignored.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use overseer_db::models::IterationResult;

use crate::classifier::OutputKind;

/// Why the agent stopped on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    AllTasksDone,
    MaxIterations,
    NoProgress,
    OutsideHours,
    #[serde(other)]
    Other,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllTasksDone => "all_tasks_done",
            Self::MaxIterations => "max_iterations",
            Self::NoProgress => "no_progress",
            Self::OutsideHours => "outside_hours",
            Self::Other => "other",
        }
    }
}

/// One structured line from the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    IterationStart {
        iteration: u32,
        performer: String,
        emoji: Option<String>,
        tasks_done: Option<u32>,
        tasks_pending: Option<u32>,
        max_iterations: Option<u32>,
    },
    IterationEnd {
        iteration: u32,
        /// Unknown values read as absent, so the result is inferred.
        #[serde(default, deserialize_with = "lenient_result")]
        result: Option<IterationResult>,
        tasks_done: Option<u32>,
        tasks_pending: Option<u32>,
        no_progress_count: Option<u32>,
        error_message: Option<String>,
    },
    Output {
        #[serde(rename = "type")]
        kind: OutputKind,
        content: String,
    },
    Paused {
        after_iteration: Option<u32>,
    },
    Resumed {},
    RateLimited {
        /// ISO-8601; a time without an offset is local time.
        reset_time: Option<String>,
    },
    Error {
        message: String,
        code: Option<i64>,
    },
    Completed {
        reason: CompletionReason,
        total_iterations: Option<u32>,
        tasks_done: Option<u32>,
        tasks_pending: Option<u32>,
    },
    Terminated {
        #[serde(default)]
        by_user: bool,
        after_iteration: Option<u32>,
    },
}

fn lenient_result<'de, D>(deserializer: D) -> Result<Option<IterationResult>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| value.parse().ok()))
}

impl AgentEvent {
    /// Parse one line. Returns `None` for anything that is not a complete,
    /// known event object.
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Wire name of the event discriminator.
    pub fn name(&self) -> &'static str {
        match self {
            Self::IterationStart { .. } => "iteration_start",
            Self::IterationEnd { .. } => "iteration_end",
            Self::Output { .. } => "output",
            Self::Paused { .. } => "paused",
            Self::Resumed {} => "resumed",
            Self::RateLimited { .. } => "rate_limited",
            Self::Error { .. } => "error",
            Self::Completed { .. } => "completed",
            Self::Terminated { .. } => "terminated",
        }
    }

    /// One-line human summary used when a lifecycle event is shown in the
    /// live output stream.
    pub fn summary(&self) -> String {
        match self {
            Self::IterationStart {
                iteration,
                performer,
                emoji,
                ..
            } => match emoji.as_deref().filter(|e| !e.is_empty()) {
                Some(emoji) => format!("Iteration {iteration} started: {emoji} {performer}"),
                None => format!("Iteration {iteration} started: {performer}"),
            },
            Self::IterationEnd {
                iteration, result, ..
            } => match result {
                Some(result) => format!("Iteration {iteration} ended: {result}"),
                None => format!("Iteration {iteration} ended"),
            },
            Self::Output { content, .. } => content.clone(),
            Self::Paused {
                after_iteration: Some(n),
            } => format!("Paused after iteration {n}"),
            Self::Paused {
                after_iteration: None,
            } => "Paused".to_string(),
            Self::Resumed {} => "Resumed".to_string(),
            Self::RateLimited {
                reset_time: Some(t),
            } => format!("Rate limited until {t}"),
            Self::RateLimited { reset_time: None } => "Rate limited".to_string(),
            Self::Error { message, .. } => format!("Error: {message}"),
            Self::Completed {
                reason,
                total_iterations,
                ..
            } => match total_iterations {
                Some(n) => format!("Completed ({}) after {n} iterations", reason.as_str()),
                None => format!("Completed ({})", reason.as_str()),
            },
            Self::Terminated {
                after_iteration: Some(n),
                ..
            } => format!("Terminated after iteration {n}"),
            Self::Terminated { .. } => "Terminated".to_string(),
        }
    }
}

const NAIVE_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a rate-limit reset time.
///
/// Accepts RFC 3339, or a date-time without an offset which is read as
/// local time. Returns `None` when nothing matches.
pub fn parse_reset_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    })
}
