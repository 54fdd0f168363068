//! The external task backlog, seen only through its pending-item count.
//!
//! The tracker snapshots the count before and after each iteration when the
//! agent does not report it itself. [`BeansBacklog`] shells out to the
//! `beans` CLI, [`FixedBacklog`] returns a count set in code and
//! [`NoBacklog`] refuses every query, so only agent-reported counts are used.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("failed to run backlog command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backlog command timed out after {0:?}")]
    Timeout(Duration),
    #[error("backlog command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("backlog returned malformed JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("backlog queries are disabled")]
    Disabled,
}

/// Done/pending split of the items the agent works on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogCounts {
    pub done: u32,
    pub pending: u32,
}

/// Source of pending-item counts.
#[async_trait]
pub trait Backlog: Send + Sync {
    async fn counts(&self) -> Result<BacklogCounts, BacklogError>;

    async fn pending_count(&self) -> Result<u32, BacklogError> {
        Ok(self.counts().await?.pending)
    }
}

// ---------------------------------------------------------------------------
// beans CLI
// ---------------------------------------------------------------------------

const PENDING_STATUSES: [&str; 3] = ["todo", "in-progress", "draft"];
const DONE_STATUSES: [&str; 2] = ["completed", "scrapped"];

#[derive(Debug, Deserialize)]
struct BeansResponse {
    #[serde(default)]
    beans: Vec<Bean>,
}

#[derive(Debug, Deserialize)]
struct Bean {
    #[serde(default)]
    status: String,
}

/// Backlog backed by the `beans` issue tracker CLI.
#[derive(Debug, Clone)]
pub struct BeansBacklog {
    command: String,
    tag: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl BeansBacklog {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(command: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            tag: tag.into(),
            working_dir: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn query(&self) -> String {
        format!(
            "{{ beans(filter: {{ tags: [{}] }}) {{ id status }} }}",
            serde_json::Value::String(self.tag.clone())
        )
    }
}

/// Count pending and done items in a `beans query --json` response.
pub fn count_beans(json: &str) -> Result<BacklogCounts, BacklogError> {
    let response: BeansResponse = serde_json::from_str(json)?;
    let mut counts = BacklogCounts::default();
    for bean in &response.beans {
        if PENDING_STATUSES.contains(&bean.status.as_str()) {
            counts.pending += 1;
        } else if DONE_STATUSES.contains(&bean.status.as_str()) {
            counts.done += 1;
        }
    }
    Ok(counts)
}

#[async_trait]
impl Backlog for BeansBacklog {
    async fn counts(&self) -> Result<BacklogCounts, BacklogError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg("query").arg("--json").arg(self.query());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| BacklogError::Timeout(self.timeout))?
            .map_err(|source| BacklogError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(BacklogError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let counts = count_beans(&String::from_utf8_lossy(&output.stdout))?;
        debug!(
            tag = %self.tag,
            pending = counts.pending,
            done = counts.done,
            "backlog counted"
        );
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// Fixed count
// ---------------------------------------------------------------------------

/// Backlog whose count is set directly. Clones share the same count.
#[derive(Debug, Clone, Default)]
pub struct FixedBacklog {
    pending: Arc<AtomicU32>,
    done: Arc<AtomicU32>,
}

impl FixedBacklog {
    pub fn new(pending: u32) -> Self {
        let backlog = Self::default();
        backlog.set_pending(pending);
        backlog
    }

    pub fn set_pending(&self, pending: u32) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn set_done(&self, done: u32) {
        self.done.store(done, Ordering::SeqCst);
    }
}

#[async_trait]
impl Backlog for FixedBacklog {
    async fn counts(&self) -> Result<BacklogCounts, BacklogError> {
        Ok(BacklogCounts {
            done: self.done.load(Ordering::SeqCst),
            pending: self.pending.load(Ordering::SeqCst),
        })
    }
}

// ---------------------------------------------------------------------------
// Disabled
// ---------------------------------------------------------------------------

/// Backlog that is never queried. Every count is an error, so callers keep
/// their last known value instead of reading a made-up zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBacklog;

#[async_trait]
impl Backlog for NoBacklog {
    async fn counts(&self) -> Result<BacklogCounts, BacklogError> {
        Err(BacklogError::Disabled)
    }
}
