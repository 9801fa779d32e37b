//! Projecting job state onto the issue and its notifications.
//!
//! These writes follow a job commit and never undo it. Failures are logged
//! and otherwise ignored; the job row stays the source of truth.

use tracing::{debug, warn};

use crate::issues::{Issue, NewNotification};
use crate::jobs::Job;
use crate::store::IssueSink;

/// A worker claimed `job`: mark the issue in progress and announce the attempt.
pub async fn project_claimed(sink: &dyn IssueSink, issue: &Issue, job: &Job) {
    if let Err(e) = sink.mark_issue_in_progress(issue.id).await {
        warn!(job_id = job.id, issue_id = issue.id, error = %e, "Failed to mark issue in progress");
    }
    notify(
        sink,
        job,
        NewNotification::ai_started(issue, job.attempts, job.max_attempts),
    )
    .await;
}

/// `job` committed as completed.
pub async fn project_completed(sink: &dyn IssueSink, issue: &Issue, job: &Job, session_id: &str) {
    let result = job.result.as_deref().unwrap_or_default();
    if let Err(e) = sink.complete_issue(issue.id, session_id, result).await {
        warn!(job_id = job.id, issue_id = issue.id, error = %e, "Failed to complete issue");
    }
    notify(sink, job, NewNotification::issue_completed(issue, result)).await;
}

/// `job` committed as failed: close the issue with the last error.
pub async fn project_failed(sink: &dyn IssueSink, issue: &Issue, job: &Job) {
    let error = job.error_msg.as_deref().unwrap_or("unknown error");
    if let Err(e) = sink.close_issue(issue.id, error).await {
        warn!(job_id = job.id, issue_id = issue.id, error = %e, "Failed to close issue");
    }
    notify(
        sink,
        job,
        NewNotification::issue_failed(issue, job.attempts, error),
    )
    .await;
}

async fn notify(sink: &dyn IssueSink, job: &Job, notification: NewNotification) {
    let kind = notification.kind;
    match sink.append_notification(&notification).await {
        Ok(n) => debug!(job_id = job.id, notification_id = n.id, %kind, "Notification sent"),
        Err(e) => warn!(job_id = job.id, %kind, error = %e, "Failed to append notification"),
    }
}
