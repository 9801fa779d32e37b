//! Stale-job reaper — returns orphaned `running` jobs to the queue.
//!
//! Runs once on startup and then on its own interval. A job is stale when it
//! has been `running` longer than the threshold, which is set above the agent
//! deadline so a live worker always commits (or kills its agent) first.
//! Reaping does not count as an attempt; a job that already used its last
//! attempt is failed instead and projected like any other final failure.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DatabaseError;
use crate::jobs::{Job, JobStatus};
use crate::store::{IssueSink, JobStore};
use crate::worker::projection;

/// Spawn the reaper background loop.
pub fn spawn_reaper(
    store: Arc<dyn JobStore>,
    sink: Arc<dyn IssueSink>,
    interval: Duration,
    stale_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?interval, stale_after = ?stale_after, "Reaper started");

        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // First tick fires immediately
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if let Err(e) = reap_once(store.as_ref(), sink.as_ref(), stale_after).await {
                error!(error = %e, "Reaper sweep failed");
            }
        }

        info!("Reaper stopped");
    })
}

/// One sweep: reclaim stale jobs and project the ones that ended up failed.
pub async fn reap_once(
    store: &dyn JobStore,
    sink: &dyn IssueSink,
    stale_after: Duration,
) -> Result<Vec<Job>, DatabaseError> {
    let reclaimed = store.reclaim_stale(stale_after).await?;
    if reclaimed.is_empty() {
        debug!("No stale jobs");
        return Ok(reclaimed);
    }

    for job in &reclaimed {
        match job.status {
            JobStatus::Pending => info!(
                job_id = job.id,
                issue_id = job.issue_id,
                attempts = job.attempts,
                "Reclaimed stale job"
            ),
            JobStatus::Failed => {
                warn!(
                    job_id = job.id,
                    issue_id = job.issue_id,
                    attempts = job.attempts,
                    "Stale job had no attempts left; failed"
                );
                match sink.get_issue(job.issue_id).await {
                    Ok(Some(issue)) => projection::project_failed(sink, &issue, job).await,
                    Ok(None) => warn!(job_id = job.id, issue_id = job.issue_id, "Issue missing"),
                    Err(e) => warn!(job_id = job.id, error = %e, "Failed to load issue"),
                }
            }
            other => debug!(job_id = job.id, status = %other, "Unexpected reclaimed status"),
        }
    }

    info!(count = reclaimed.len(), "Reaper sweep complete");
    Ok(reclaimed)
}
