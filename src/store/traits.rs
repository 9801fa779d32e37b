//! Persistence traits — the job queue and the issue/notification sink.
//!
//! Both are implemented by `LibSqlBackend`; the worker takes them as separate
//! trait objects so the job table stays the only thing it coordinates on.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::issues::{Issue, NewIssue, NewNotification, Notification};
use crate::jobs::{Job, JobCounts, JobStatus};

/// Durable job queue.
///
/// Commits take the `attempt` the worker was handed at claim time. A commit
/// only applies while the row is still `running` at that attempt; otherwise it
/// returns `Ok(None)` and changes nothing.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Queue ───────────────────────────────────────────────────────

    /// Insert a pending job with the default attempt ceiling.
    ///
    /// Fails with `DatabaseError::Conflict` if the issue already has a
    /// pending or running job.
    async fn enqueue(&self, issue_id: i64) -> Result<Job, DatabaseError>;

    /// Insert a pending job with an explicit attempt ceiling.
    async fn enqueue_with(&self, issue_id: i64, max_attempts: u32) -> Result<Job, DatabaseError>;

    /// Atomically claim the oldest claimable pending job.
    async fn claim_next(&self) -> Result<Option<Job>, DatabaseError>;

    /// `running → completed`.
    async fn commit_success(
        &self,
        job_id: i64,
        attempt: u32,
        result: &str,
    ) -> Result<Option<Job>, DatabaseError>;

    /// `running → pending` (claimable again after `retry_backoff`) or
    /// `running → failed` once the attempt ceiling is reached.
    async fn commit_failure(
        &self,
        job_id: i64,
        attempt: u32,
        error_msg: &str,
        retry_backoff: Duration,
    ) -> Result<Option<Job>, DatabaseError>;

    /// Requeue running jobs whose `started_at` is older than `older_than`.
    ///
    /// Returns the jobs as they are after the move; a job with no attempts
    /// left comes back `failed` instead of `pending`.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<Job>, DatabaseError>;

    // ── Read side ───────────────────────────────────────────────────

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, DatabaseError>;

    /// The pending or running job for an issue, if any.
    async fn active_job_for_issue(&self, issue_id: i64) -> Result<Option<Job>, DatabaseError>;

    /// Jobs in one status, oldest first.
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError>;

    async fn job_counts(&self) -> Result<JobCounts, DatabaseError>;
}

/// Issue fields and notifications the dispatcher writes.
#[async_trait]
pub trait IssueSink: Send + Sync {
    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, DatabaseError>;

    async fn get_issue(&self, issue_id: i64) -> Result<Option<Issue>, DatabaseError>;

    async fn mark_issue_in_progress(&self, issue_id: i64) -> Result<(), DatabaseError>;

    /// Set `completed` with the agent's session and result.
    async fn complete_issue(
        &self,
        issue_id: i64,
        session_id: &str,
        result: &str,
    ) -> Result<(), DatabaseError>;

    /// Set `closed`, storing the diagnostic as `ai_result`.
    async fn close_issue(&self, issue_id: i64, diagnostic: &str) -> Result<(), DatabaseError>;

    async fn append_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, DatabaseError>;

    /// Notifications about an issue, oldest first.
    async fn list_notifications(&self, issue_id: i64) -> Result<Vec<Notification>, DatabaseError>;
}
