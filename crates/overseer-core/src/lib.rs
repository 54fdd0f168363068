//! Process orchestration and event pipeline for the overseer supervisor.
//!
//! Raw agent output flows through [`classifier`] into the
//! [`tracker::IterationTracker`], which folds it into iteration records for
//! the history ledger. The [`supervisor::Supervisor`] owns the agent
//! subprocess and pushes every classified line and state transition into
//! the [`broadcast::Broadcaster`] for live observers.

pub mod backlog;
pub mod broadcast;
pub mod classifier;
pub mod events;
pub mod hours;
pub mod supervisor;
pub mod tracker;
