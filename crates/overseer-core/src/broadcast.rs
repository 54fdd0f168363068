//! Event Broadcaster: fan-out of live events to connected observers.
//!
//! Every subscriber gets its own bounded channel. Publishing never waits:
//! a subscriber whose channel is full or closed is unregistered on the
//! spot. There is no replay; late subscribers only see later events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use uuid::Uuid;

use overseer_db::models::{IterationResult, NewIterationRecord};

use crate::classifier::OutputLine;
use crate::supervisor::StatusSnapshot;
use crate::tracker::IterationStarted;

/// Default per-subscriber queue depth.
pub const DEFAULT_CAPACITY: usize = 256;

/// Summary of a closed iteration as shown to live observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationEnded {
    pub iteration: i64,
    pub performer: String,
    pub result: IterationResult,
    pub tasks_before: i64,
    pub tasks_after: i64,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub no_progress_count: u32,
    /// Ledger id; `None` when the append failed.
    pub record_id: Option<i64>,
}

impl IterationEnded {
    pub fn from_record(
        record: &NewIterationRecord,
        no_progress_count: u32,
        record_id: Option<i64>,
    ) -> Self {
        Self {
            iteration: record.iteration_number,
            performer: record.performer_name.clone(),
            result: record.result,
            tasks_before: record.tasks_before,
            tasks_after: record.tasks_after,
            duration_seconds: record.duration_seconds,
            error_message: record.error_message.clone(),
            no_progress_count,
            record_id,
        }
    }
}

/// Everything a live observer can receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    StatusChange(StatusSnapshot),
    IterationStart(IterationStarted),
    OutputLine(OutputLine),
    IterationEnd(IterationEnded),
    RateLimited { until: DateTime<Utc> },
    Error { message: String },
}

impl LiveEvent {
    /// Event name used on the wire (the `type` tag).
    pub fn name(&self) -> &'static str {
        match self {
            Self::StatusChange(_) => "status_change",
            Self::IterationStart(_) => "iteration_start",
            Self::OutputLine(_) => "output_line",
            Self::IterationEnd(_) => "iteration_end",
            Self::RateLimited { .. } => "rate_limited",
            Self::Error { .. } => "error",
        }
    }
}

/// A registered observer's receiving end.
#[derive(Debug)]
pub struct Subscription {
    pub id: Uuid,
    rx: mpsc::Receiver<LiveEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<LiveEvent> {
        ReceiverStream::new(self.rx)
    }
}

/// Subscriber registry. Clones share the registry.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    subscribers: Arc<RwLock<HashMap<Uuid, mpsc::Sender<LiveEvent>>>>,
    capacity: usize,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn register(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let count = {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, tx);
            subscribers.len()
        };
        debug!(subscriber = %id, count, "subscriber registered");
        Subscription { id, rx }
    }

    /// Remove a subscriber. Returns whether it was registered.
    pub async fn unregister(&self, id: Uuid) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "subscriber unregistered");
        }
        removed
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver `event` to every subscriber. Returns how many accepted it.
    pub async fn publish(&self, event: LiveEvent) -> usize {
        let subscribers: Vec<(Uuid, mpsc::Sender<LiveEvent>)> = self
            .subscribers
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, tx) in subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = %id, event = event.name(), "slow subscriber dropped");
                    dropped.push(id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dropped {
                subscribers.remove(&id);
            }
        }
        delivered
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
