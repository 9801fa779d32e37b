//! Error types for issue dispatch.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
///
/// `Pool` and `Query` are persistence failures: the caller cannot tell whether
/// the write landed and must not assume it did.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether retrying the same operation could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Pool(_) | Self::Query(_))
    }
}

/// Job state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job in state {from} cannot handle {event}")]
    InvalidTransition { from: String, event: String },

    #[error("Job already used all {max_attempts} attempts")]
    AttemptsExhausted { max_attempts: u32 },

    #[error("Issue {issue_id} not found for job {job_id}")]
    IssueMissing { job_id: i64, issue_id: i64 },
}

/// Agent execution errors, rendered into a job's `error_msg`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent failed to start: {reason}")]
    StartFailed { reason: String },

    #[error("Agent timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Agent exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("Agent was killed by a signal")]
    Killed,

    #[error("Agent produced no parsable result: {reason}")]
    UnparsableOutput { reason: String },
}
