//! Process state owned by the supervisor.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hours::AllowedHours;

/// Lifecycle phase driven by control commands and confirmed agent events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Stopped,
    Running,
    Paused,
}

/// Reported status. `RateLimited` is computed from the countdown and wins
/// over `Paused`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Stopped,
    Running,
    Paused,
    RateLimited,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessState {
    pub phase: Phase,
    pub pid: Option<u32>,
    pub iteration: Option<u32>,
    pub max_iterations: Option<u32>,
    pub performer: Option<String>,
    pub performer_emoji: Option<String>,
    pub tasks_pending: Option<u32>,
    pub tasks_completed: Option<u32>,
    pub no_progress_count: u32,
    pub allowed_hours: Option<AllowedHours>,
    pub started_at: Option<DateTime<Utc>>,
    pub rate_limited_until: Option<DateTime<Utc>>,
    /// A pause signal was sent but the agent has not confirmed it yet.
    pub pause_requested: bool,
}

impl ProcessState {
    /// Fresh state for a newly spawned agent.
    pub fn started(
        pid: u32,
        performer: Option<String>,
        max_iterations: Option<u32>,
        allowed_hours: Option<AllowedHours>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            phase: Phase::Running,
            pid: Some(pid),
            performer,
            max_iterations,
            allowed_hours,
            started_at: Some(now),
            ..Self::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase != Phase::Stopped
    }

    pub fn is_rate_limited(&self, now: DateTime<Utc>) -> bool {
        self.rate_limited_until.is_some_and(|until| until > now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> Status {
        match self.phase {
            Phase::Stopped => Status::Stopped,
            _ if self.is_rate_limited(now) => Status::RateLimited,
            Phase::Paused => Status::Paused,
            Phase::Running => Status::Running,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> StatusSnapshot {
        let rate_limited_until = self.rate_limited_until.filter(|until| *until > now);
        StatusSnapshot {
            status: self.status(now),
            running: self.is_active(),
            paused: self.phase == Phase::Paused,
            pause_requested: self.pause_requested,
            pid: self.pid,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            performer: self.performer.clone(),
            performer_emoji: self.performer_emoji.clone(),
            tasks_pending: self.tasks_pending,
            tasks_completed: self.tasks_completed,
            no_progress_count: self.no_progress_count,
            allowed_hours: self.allowed_hours,
            started_at: self.started_at,
            rate_limited_until,
            rate_limit_seconds_remaining: rate_limited_until
                .map(|until| (until - now).num_seconds().max(0)),
        }
    }
}

/// Point-in-time view of [`ProcessState`] for observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub status: Status,
    pub running: bool,
    pub paused: bool,
    pub pause_requested: bool,
    pub pid: Option<u32>,
    pub iteration: Option<u32>,
    pub max_iterations: Option<u32>,
    pub performer: Option<String>,
    pub performer_emoji: Option<String>,
    pub tasks_pending: Option<u32>,
    pub tasks_completed: Option<u32>,
    pub no_progress_count: u32,
    pub allowed_hours: Option<AllowedHours>,
    pub started_at: Option<DateTime<Utc>>,
    pub rate_limited_until: Option<DateTime<Utc>>,
    pub rate_limit_seconds_remaining: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn default_state_is_stopped() {
        let state = ProcessState::default();
        let snap = state.snapshot(Utc::now());
        assert_eq!(snap.status, Status::Stopped);
        assert!(!snap.running);
        assert!(!snap.paused);
        assert_eq!(snap.pid, None);
    }

    #[test]
    fn rate_limit_wins_over_pause() {
        let now = Utc::now();
        let mut state = ProcessState::started(42, None, None, None, now);
        state.phase = Phase::Paused;
        state.rate_limited_until = Some(now + Duration::minutes(10));

        let snap = state.snapshot(now);
        assert_eq!(snap.status, Status::RateLimited);
        assert!(snap.paused);
        assert_eq!(snap.rate_limit_seconds_remaining, Some(600));
    }

    #[test]
    fn elapsed_rate_limit_reverts() {
        let now = Utc::now();
        let mut state = ProcessState::started(42, None, None, None, now);
        state.rate_limited_until = Some(now - Duration::seconds(1));
        let snap = state.snapshot(now);
        assert_eq!(snap.status, Status::Running);
        assert_eq!(snap.rate_limited_until, None);
    }

    #[test]
    fn stopped_ignores_rate_limit() {
        let now = Utc::now();
        let state = ProcessState {
            rate_limited_until: Some(now + Duration::minutes(1)),
            ..ProcessState::default()
        };
        assert_eq!(state.status(now), Status::Stopped);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Status::RateLimited).unwrap(),
            serde_json::json!("rate_limited")
        );
    }
}
