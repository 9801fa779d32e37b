//! Dispatch worker — claim, run the agent, commit, project.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentOutcome, AgentRunner, AgentTask};
use crate::config::DispatchConfig;
use crate::error::{DatabaseError, JobError};
use crate::issues::Issue;
use crate::jobs::{Job, JobEvent, JobStatus};
use crate::store::{IssueSink, JobStore};
use crate::worker::projection;

/// First delay between commit retries.
const COMMIT_RETRY_BASE: Duration = Duration::from_millis(250);

/// Ceiling for the commit retry delay.
const COMMIT_RETRY_MAX: Duration = Duration::from_secs(30);

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub sink: Arc<dyn IssueSink>,
    pub agent: Arc<dyn AgentRunner>,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Delay before a failed attempt becomes claimable again.
    pub retry_backoff: Duration,
}

impl WorkerDeps {
    pub fn new(
        store: Arc<dyn JobStore>,
        sink: Arc<dyn IssueSink>,
        agent: Arc<dyn AgentRunner>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            store,
            sink,
            agent,
            poll_interval: config.poll_interval,
            retry_backoff: config.retry_backoff,
        }
    }
}

/// Where a worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claiming,
    Executing,
    Committing,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Executing => "executing",
            Self::Committing => "committing",
        };
        f.write_str(s)
    }
}

/// Result of one claim → execute → commit cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Nothing was claimable.
    Idle,
    /// The attempt was committed; holds the job as stored afterwards.
    Committed(Job),
    /// The job changed hands before the commit landed (reaped, re-claimed or
    /// already terminal). Nothing was written.
    Superseded { job_id: i64 },
    /// Shutdown interrupted the attempt; the job stays `running` for the reaper.
    Interrupted { job_id: i64 },
}

/// What the worker learned from the agent, reduced to what gets committed.
enum Verdict {
    Success { session_id: String, result: String },
    Failure { error_msg: String },
}

/// How loading a claimed job's issue ended.
enum IssueLoad {
    Found(Issue),
    /// The issue is gone or unreadable; the attempt fails with this message.
    Unusable(String),
    Interrupted,
}

/// A long-lived worker that processes jobs one at a time.
pub struct Worker {
    id: usize,
    deps: WorkerDeps,
    state: WorkerState,
}

impl Worker {
    pub fn new(id: usize, deps: WorkerDeps) -> Self {
        Self {
            id,
            deps,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        &self.deps.store
    }

    fn sink(&self) -> &Arc<dyn IssueSink> {
        &self.deps.sink
    }

    fn set_state(&mut self, state: WorkerState) {
        if self.state != state {
            tracing::trace!(worker_id = self.id, from = %self.state, to = %state, "Worker state");
            self.state = state;
        }
    }

    /// Poll interval plus up to 25% jitter so idle workers spread out.
    fn poll_delay(&self) -> Duration {
        let base = self.deps.poll_interval;
        let jitter_ms = (base.as_millis() / 4) as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run until `cancel` fires. Attempt-level failures never stop the loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(worker_id = self.id, "Worker started");

        while !cancel.is_cancelled() {
            let idle = match self.run_once(&cancel).await {
                Ok(CycleOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    warn!(worker_id = self.id, error = %e, "Failed to claim job");
                    true
                }
            };
            self.set_state(WorkerState::Idle);

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_delay()) => {}
                }
            }
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    /// One claim → execute → commit → project cycle.
    ///
    /// Only a failed claim is an error; everything after the claim is
    /// reported through `CycleOutcome`.
    pub async fn run_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, DatabaseError> {
        self.set_state(WorkerState::Claiming);
        let Some(job) = self.store().claim_next().await? else {
            return Ok(CycleOutcome::Idle);
        };
        info!(
            worker_id = self.id,
            job_id = job.id,
            issue_id = job.issue_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Job claimed"
        );

        let issue = match self.load_issue(&job, cancel).await {
            IssueLoad::Found(issue) => issue,
            IssueLoad::Unusable(error_msg) => {
                let verdict = Verdict::Failure { error_msg };
                return Ok(self.commit(&job, None, verdict, cancel).await);
            }
            IssueLoad::Interrupted => return Ok(CycleOutcome::Interrupted { job_id: job.id }),
        };

        projection::project_claimed(self.sink().as_ref(), &issue, &job).await;

        self.set_state(WorkerState::Executing);
        let task = AgentTask {
            job_id: job.id,
            issue_id: issue.id,
            attempt: job.attempts,
            prompt: issue.prompt(),
        };
        let outcome = self.deps.agent.run(&task, cancel).await;

        let verdict = match outcome {
            AgentOutcome::Cancelled { .. } => {
                info!(
                    worker_id = self.id,
                    job_id = job.id,
                    "Agent cancelled by shutdown; leaving job for the reaper"
                );
                return Ok(CycleOutcome::Interrupted { job_id: job.id });
            }
            AgentOutcome::Success { session_id, result } => Verdict::Success { session_id, result },
            other => Verdict::Failure {
                error_msg: other
                    .error_message()
                    .unwrap_or_else(|| "Agent run failed".to_string()),
            },
        };

        Ok(self.commit(&job, Some(&issue), verdict, cancel).await)
    }

    /// Load the job's issue, retrying persistence failures.
    ///
    /// Only a missing or unreadable issue costs the attempt.
    async fn load_issue(&self, job: &Job, cancel: &CancellationToken) -> IssueLoad {
        let mut delay = COMMIT_RETRY_BASE;
        loop {
            match self.sink().get_issue(job.issue_id).await {
                Ok(Some(issue)) => return IssueLoad::Found(issue),
                Ok(None) => {
                    let error = JobError::IssueMissing {
                        job_id: job.id,
                        issue_id: job.issue_id,
                    };
                    warn!(worker_id = self.id, job_id = job.id, "{error}");
                    return IssueLoad::Unusable(error.to_string());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        worker_id = self.id,
                        job_id = job.id,
                        error = %e,
                        retry_in = ?delay,
                        "Failed to load issue; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return IssueLoad::Interrupted,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(COMMIT_RETRY_MAX);
                }
                Err(e) => {
                    warn!(worker_id = self.id, job_id = job.id, error = %e, "Failed to load issue");
                    return IssueLoad::Unusable(format!(
                        "Failed to load issue {}: {e}",
                        job.issue_id
                    ));
                }
            }
        }
    }

    async fn try_commit(&self, job: &Job, verdict: &Verdict) -> Result<Option<Job>, DatabaseError> {
        match verdict {
            Verdict::Success { result, .. } => {
                self.store().commit_success(job.id, job.attempts, result).await
            }
            Verdict::Failure { error_msg } => {
                self.store()
                    .commit_failure(job.id, job.attempts, error_msg, self.deps.retry_backoff)
                    .await
            }
        }
    }

    /// After a commit error, the write may still have landed. Re-read the job
    /// and accept it if it holds exactly what this verdict would have written.
    async fn landed(&self, job: &Job, verdict: &Verdict) -> Result<Option<Job>, DatabaseError> {
        let Some(current) = self.store().get_job(job.id).await? else {
            return Ok(None);
        };
        if current.attempts != job.attempts {
            return Ok(None);
        }
        let ours = match verdict {
            Verdict::Success { result, .. } => {
                current.status == JobStatus::Completed
                    && current.result.as_deref() == Some(result.as_str())
            }
            Verdict::Failure { error_msg } => {
                job.next_status(JobEvent::Fail).ok() == Some(current.status)
                    && current.error_msg.as_deref() == Some(error_msg.as_str())
            }
        };
        Ok(ours.then_some(current))
    }

    /// Commit the verdict, retrying persistence failures, then project it.
    async fn commit(
        &mut self,
        job: &Job,
        issue: Option<&Issue>,
        verdict: Verdict,
        cancel: &CancellationToken,
    ) -> CycleOutcome {
        self.set_state(WorkerState::Committing);

        let mut delay = COMMIT_RETRY_BASE;
        let mut ambiguous = false;
        let committed = loop {
            let result = match self.try_commit(job, &verdict).await {
                Ok(None) if ambiguous => self.landed(job, &verdict).await,
                other => other,
            };

            match result {
                Ok(Some(committed)) => break committed,
                Ok(None) => {
                    warn!(
                        worker_id = self.id,
                        job_id = job.id,
                        attempt = job.attempts,
                        "Job changed hands before commit; discarding result"
                    );
                    return CycleOutcome::Superseded { job_id: job.id };
                }
                Err(e) if e.is_transient() => {
                    ambiguous = true;
                    warn!(
                        worker_id = self.id,
                        job_id = job.id,
                        error = %e,
                        retry_in = ?delay,
                        "Commit failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return CycleOutcome::Interrupted { job_id: job.id };
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(COMMIT_RETRY_MAX);
                }
                Err(e) => {
                    error!(worker_id = self.id, job_id = job.id, error = %e, "Commit rejected");
                    return CycleOutcome::Superseded { job_id: job.id };
                }
            }
        };

        info!(
            worker_id = self.id,
            job_id = committed.id,
            attempt = committed.attempts,
            status = %committed.status,
            "Job committed"
        );

        // A terminal failure still closes the issue if it can be read now.
        let issue = match issue {
            Some(issue) => Some(issue.clone()),
            None if committed.status == JobStatus::Failed => {
                self.sink().get_issue(committed.issue_id).await.ok().flatten()
            }
            None => None,
        };

        match (issue.as_ref(), committed.status, &verdict) {
            (Some(issue), JobStatus::Completed, Verdict::Success { session_id, .. }) => {
                projection::project_completed(self.sink().as_ref(), issue, &committed, session_id)
                    .await;
            }
            (Some(issue), JobStatus::Failed, _) => {
                projection::project_failed(self.sink().as_ref(), issue, &committed).await;
            }
            (None, status, _) => {
                debug!(job_id = committed.id, %status, "No issue to project onto");
            }
            (_, JobStatus::Pending, _) => {
                debug!(
                    job_id = committed.id,
                    attempts = committed.attempts,
                    max_attempts = committed.max_attempts,
                    "Job will be retried"
                );
            }
            (_, status, _) => {
                debug!(job_id = committed.id, %status, "Nothing to project");
            }
        }

        CycleOutcome::Committed(committed)
    }
}
