//! Core domain logic for the demographic count reconciliation engine.
//! This crate is the single source of truth for breakdown, count and flag
//! invariants.

pub mod breakdown;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use config::{open_configured, ConfigError, EngineConfig};
pub use db::{open_db, open_db_in_memory, open_db_with, DbError, DbOptions};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::catalog::{Actor, Role};
pub use model::count::{BreakdownRow, Count, CountScope};
pub use model::flag::{Flag, FlagDelta, FlagTarget};
pub use repo::{RepoError, RepoResult};
pub use service::submission_service::{
    GroupSubmission, GroupSubmissionResult, SubmissionError, SubmissionService,
    TaskCountBatch, TaskCountSubmission, TaskCountsResult,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
