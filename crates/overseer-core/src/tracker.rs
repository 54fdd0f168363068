//! Iteration Tracker: folds the classified output stream into iteration
//! records.
//!
//! An iteration opens on `iteration_start` and closes on the first of
//! `iteration_end`, `rate_limited`, `error`, `terminated`, `completed`, the
//! next `iteration_start`, or process exit. Result assignment is
//! deterministic:
//!
//! | close | result |
//! |---|---|
//! | `iteration_end` with `result` | that result |
//! | `iteration_end` without `result` | `success` if pending went down, else `no_progress` |
//! | `rate_limited` | `rate_limited` |
//! | `error` | `error`, with the message |
//! | anything else | `cancelled` |
//!
//! Plain-text agents announce boundaries in prose instead (see
//! [`TextMarker`]). "iteration N" opens an iteration and closes an open one
//! with the inferred result; "rate limit", "no progress", `error:` or
//! "fatal error", and "iteration complete" or "completed successfully"
//! close it as `rate_limited`, `no_progress`, `error` and `success`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use overseer_db::models::{IterationResult, NewIterationRecord};

use crate::backlog::{Backlog, BacklogCounts, BacklogError};
use crate::classifier::{Classified, OutputLine, TextMarker};
use crate::events::AgentEvent;

/// Most output lines kept for the open iteration.
pub const OUTPUT_BUFFER_LINES: usize = 2000;

/// What ended an iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseCause {
    End {
        result: Option<IterationResult>,
        error_message: Option<String>,
    },
    RateLimited,
    Error(String),
    Cancelled,
}

/// An iteration that has just opened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationStarted {
    pub iteration: u32,
    pub performer: String,
    pub emoji: String,
    pub tasks_before: u32,
    pub started_at: DateTime<Utc>,
}

/// Effect of feeding one classified line to the tracker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observed {
    /// Iteration closed by this line, ready for the history ledger.
    pub closed: Option<NewIterationRecord>,
    pub started: Option<IterationStarted>,
}

#[derive(Debug)]
struct OpenIteration {
    iteration: u32,
    performer: String,
    emoji: String,
    tasks_before: u32,
    started_at: DateTime<Utc>,
    output: VecDeque<OutputLine>,
}

pub struct IterationTracker {
    backlog: Arc<dyn Backlog>,
    open: Option<OpenIteration>,
    last_pending: Option<u32>,
    last_done: Option<u32>,
    no_progress_count: u32,
    /// Performer for iterations opened by text markers.
    performer: Option<String>,
    emoji: String,
}

impl std::fmt::Debug for IterationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IterationTracker")
            .field("open", &self.open.as_ref().map(|o| o.iteration))
            .field("last_pending", &self.last_pending)
            .field("last_done", &self.last_done)
            .field("no_progress_count", &self.no_progress_count)
            .finish()
    }
}

impl IterationTracker {
    pub fn new(backlog: Arc<dyn Backlog>) -> Self {
        Self {
            backlog,
            open: None,
            last_pending: None,
            last_done: None,
            no_progress_count: 0,
            performer: None,
            emoji: String::new(),
        }
    }

    /// Performer assumed until the agent names one.
    pub fn with_performer(mut self, performer: Option<String>) -> Self {
        self.performer = performer;
        self
    }

    pub fn no_progress_count(&self) -> u32 {
        self.no_progress_count
    }

    pub fn last_pending(&self) -> Option<u32> {
        self.last_pending
    }

    /// Done count from the most recent backlog answer.
    pub fn last_done(&self) -> Option<u32> {
        self.last_done
    }

    /// Fill in counts read before any snapshot was taken. Counts already
    /// known are newer and win.
    pub fn seed(&mut self, counts: BacklogCounts) {
        self.last_pending.get_or_insert(counts.pending);
        self.last_done.get_or_insert(counts.done);
    }

    pub fn current_iteration(&self) -> Option<u32> {
        self.open.as_ref().map(|o| o.iteration)
    }

    /// Output buffered for the open iteration, oldest first.
    pub fn buffered_output(&self) -> impl Iterator<Item = &OutputLine> {
        self.open.iter().flat_map(|o| o.output.iter())
    }

    /// Feed one classified line, in the order the agent wrote it.
    pub async fn observe(&mut self, classified: &Classified) -> Observed {
        let observed = match classified {
            Classified::Structured(event) => self.observe_event(event).await,
            Classified::Heuristic(line) => {
                if let Some(performer) = classified.text_performer() {
                    self.performer = Some(performer);
                }
                match classified.text_marker() {
                    Some(marker) => self.observe_marker(marker, &line.content).await,
                    None => Observed::default(),
                }
            }
        };

        self.push_output(classified.output_line());
        observed
    }

    async fn observe_event(&mut self, event: &AgentEvent) -> Observed {
        let mut observed = Observed::default();

        match event {
            AgentEvent::IterationStart {
                iteration,
                performer,
                emoji,
                tasks_pending,
                ..
            } => {
                if self.open.is_some() {
                    observed.closed = self.close(CloseCause::Cancelled, *tasks_pending).await;
                }
                let emoji = emoji.clone().unwrap_or_default();
                self.performer = Some(performer.clone());
                self.emoji = emoji.clone();
                observed.started = Some(
                    self.begin(*iteration, performer.clone(), emoji, *tasks_pending)
                        .await,
                );
            }
            AgentEvent::IterationEnd {
                result,
                tasks_pending,
                error_message,
                ..
            } => {
                let cause = CloseCause::End {
                    result: *result,
                    error_message: error_message.clone(),
                };
                observed.closed = self.close(cause, *tasks_pending).await;
            }
            AgentEvent::RateLimited { .. } => {
                observed.closed = self.close(CloseCause::RateLimited, None).await;
            }
            AgentEvent::Error { message, .. } => {
                observed.closed = self.close(CloseCause::Error(message.clone()), None).await;
            }
            AgentEvent::Completed { tasks_pending, .. } => {
                observed.closed = self.close(CloseCause::Cancelled, *tasks_pending).await;
            }
            AgentEvent::Terminated { .. } => {
                observed.closed = self.close(CloseCause::Cancelled, None).await;
            }
            AgentEvent::Output { .. } | AgentEvent::Paused { .. } | AgentEvent::Resumed {} => {}
        }

        observed
    }

    async fn observe_marker(&mut self, marker: TextMarker, line: &str) -> Observed {
        let mut observed = Observed::default();
        let end = |result: Option<IterationResult>| CloseCause::End {
            result,
            error_message: None,
        };

        match marker {
            TextMarker::Start(iteration) => {
                if self.open.is_some() {
                    observed.closed = self.close(end(None), None).await;
                }
                let performer = self.performer.clone().unwrap_or_else(|| "unknown".to_string());
                let emoji = self.emoji.clone();
                observed.started = Some(self.begin(iteration, performer, emoji, None).await);
            }
            TextMarker::RateLimited => {
                observed.closed = self.close(CloseCause::RateLimited, None).await;
            }
            TextMarker::NoProgress => {
                observed.closed = self.close(end(Some(IterationResult::NoProgress)), None).await;
            }
            TextMarker::Error => {
                observed.closed = self.close(CloseCause::Error(line.to_string()), None).await;
            }
            TextMarker::Complete => {
                observed.closed = self.close(end(Some(IterationResult::Success)), None).await;
            }
        }

        observed
    }

    /// Close whatever is open because the process went away.
    pub async fn finish(&mut self) -> Option<NewIterationRecord> {
        self.close(CloseCause::Cancelled, None).await
    }

    /// Open a new iteration. The caller must close any open one first.
    pub async fn begin(
        &mut self,
        iteration: u32,
        performer: String,
        emoji: String,
        reported_pending: Option<u32>,
    ) -> IterationStarted {
        let tasks_before = self.snapshot_pending(reported_pending).await;
        let started_at = Utc::now();
        debug!(iteration, %performer, tasks_before, "iteration opened");

        self.open = Some(OpenIteration {
            iteration,
            performer: performer.clone(),
            emoji: emoji.clone(),
            tasks_before,
            started_at,
            output: VecDeque::new(),
        });

        IterationStarted {
            iteration,
            performer,
            emoji,
            tasks_before,
            started_at,
        }
    }

    /// Append a line to the open iteration's buffer. Dropped when nothing
    /// is open.
    pub fn push_output(&mut self, line: OutputLine) {
        if let Some(open) = self.open.as_mut() {
            if open.output.len() == OUTPUT_BUFFER_LINES {
                open.output.pop_front();
            }
            open.output.push_back(line);
        }
    }

    /// Close the open iteration, if any, and build its record.
    pub async fn close(
        &mut self,
        cause: CloseCause,
        reported_pending: Option<u32>,
    ) -> Option<NewIterationRecord> {
        let open = self.open.take()?;
        let tasks_after = self.snapshot_pending(reported_pending).await;
        let ended_at = Utc::now().max(open.started_at);
        let duration_seconds = (ended_at - open.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let progressed = tasks_after < open.tasks_before;
        let (result, error_message) = match cause {
            CloseCause::End {
                result: Some(result),
                error_message,
            } => (result, error_message),
            CloseCause::End {
                result: None,
                error_message,
            } if progressed => (IterationResult::Success, error_message),
            CloseCause::End {
                result: None,
                error_message,
            } => (IterationResult::NoProgress, error_message),
            CloseCause::RateLimited => (IterationResult::RateLimited, None),
            CloseCause::Error(message) => (IterationResult::Error, Some(message)),
            CloseCause::Cancelled => (IterationResult::Cancelled, None),
        };

        if progressed {
            self.no_progress_count = 0;
        } else if tasks_after == open.tasks_before || result == IterationResult::NoProgress {
            self.no_progress_count += 1;
        }

        debug!(
            iteration = open.iteration,
            %result,
            tasks_before = open.tasks_before,
            tasks_after,
            no_progress_count = self.no_progress_count,
            "iteration closed"
        );

        Some(NewIterationRecord {
            iteration_number: i64::from(open.iteration),
            performer_name: open.performer,
            performer_emoji: open.emoji,
            result,
            tasks_before: i64::from(open.tasks_before),
            tasks_after: i64::from(tasks_after),
            duration_seconds,
            started_at: open.started_at,
            ended_at,
            error_message,
        })
    }

    async fn snapshot_pending(&mut self, reported: Option<u32>) -> u32 {
        if let Some(pending) = reported {
            self.last_pending = Some(pending);
            return pending;
        }
        match self.backlog.counts().await {
            Ok(counts) => {
                self.last_pending = Some(counts.pending);
                self.last_done = Some(counts.done);
                counts.pending
            }
            Err(BacklogError::Disabled) => self.last_pending.unwrap_or(0),
            Err(e) => {
                let fallback = self.last_pending.unwrap_or(0);
                warn!(error = %e, fallback, "backlog count unavailable, using last known count");
                fallback
            }
        }
    }
}
