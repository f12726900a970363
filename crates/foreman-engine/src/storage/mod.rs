//! SQLite storage layer for the engine.
//!
//! One logical collection per data model: features, agent runs, queued jobs,
//! durable messages. Queries live in per-collection files as `impl Database`
//! blocks; conditional updates return whether a row was affected so callers
//! can implement atomic claim/dequeue semantics.

mod db;
mod feature_queries;
mod job_queries;
mod message_queries;
mod models;
mod run_queries;

pub use db::Database;
pub use feature_queries::NewFeature;
pub use foreman_core::db::DatabaseError;
pub use models::{
    FeatureRow, FeatureStatus, JobRow, JobStatus, MessageRow, RunRow, RunStatus,
};
