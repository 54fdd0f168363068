//! Durable iteration history for the overseer supervisor.
//!
//! The history is an append-only SQLite ledger of completed agent
//! iterations. [`store::HistoryStore`] is the handle the supervisor and the
//! control API share; [`queries`] holds the raw SQL.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use store::HistoryStore;
