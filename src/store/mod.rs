//! Persistence layer — libSQL-backed job queue, issues and notifications.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{IssueSink, JobStore};
