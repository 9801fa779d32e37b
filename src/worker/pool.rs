//! Fixed-size pool of dispatch workers.

use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::worker::{Worker, WorkerDeps};

/// Default number of workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// How a pool shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Workers that returned within the grace period.
    pub drained: usize,
    /// Workers aborted after the grace period.
    pub aborted: usize,
}

/// Handles to running workers plus the token that stops them.
pub struct WorkerPool {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers sharing `deps`.
    ///
    /// The pool stops when `parent` is cancelled or when `shutdown` is called.
    pub fn spawn(count: usize, deps: WorkerDeps, parent: &CancellationToken) -> Self {
        let cancel = parent.child_token();
        let handles = (0..count)
            .map(|id| {
                let worker = Worker::new(id, deps.clone());
                tokio::spawn(worker.run(cancel.clone()))
            })
            .collect();

        info!(workers = count, "Worker pool started");
        Self { cancel, handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming, wait up to `grace` for workers to return, then abort the rest.
    ///
    /// In-flight agent runs are killed by the cancellation; their jobs stay
    /// `running` until the reaper reclaims them.
    pub async fn shutdown(self, grace: Duration) -> ShutdownReport {
        self.cancel.cancel();
        let deadline = Instant::now() + grace;

        let finished = join_all(self.handles.into_iter().map(|mut handle| async move {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    warn!(error = %e, "Worker task ended abnormally");
                    true
                }
                Err(_) => {
                    handle.abort();
                    false
                }
            }
        }))
        .await;

        let drained = finished.iter().filter(|done| **done).count();
        let report = ShutdownReport {
            drained,
            aborted: finished.len() - drained,
        };
        if report.aborted > 0 {
            warn!(aborted = report.aborted, "Workers aborted after grace period");
        }
        info!(drained = report.drained, "Worker pool stopped");
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::{AgentOutcome, AgentRunner, AgentTask};
    use crate::issues::NewIssue;
    use crate::jobs::JobStatus;
    use crate::store::{IssueSink, JobStore, LibSqlBackend};

    struct CountingAgent {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl AgentRunner for CountingAgent {
        async fn run(&self, task: &AgentTask, _cancel: &CancellationToken) -> AgentOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            AgentOutcome::Success {
                session_id: format!("s-{}", task.job_id),
                result: "ok".into(),
            }
        }
    }

    /// Ignores cancellation, so only an abort can stop it.
    struct StubbornAgent;

    #[async_trait]
    impl AgentRunner for StubbornAgent {
        async fn run(&self, _task: &AgentTask, _cancel: &CancellationToken) -> AgentOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            AgentOutcome::Success {
                session_id: "never".into(),
                result: "never".into(),
            }
        }
    }

    fn deps(db: &Arc<LibSqlBackend>, agent: Arc<dyn AgentRunner>) -> WorkerDeps {
        WorkerDeps {
            store: db.clone(),
            sink: db.clone(),
            agent,
            poll_interval: Duration::from_millis(10),
            retry_backoff: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn pool_drains_queue_exactly_once_per_job() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for i in 0..6 {
            let issue = db
                .create_issue(&NewIssue::new(1, 1, format!("issue {i}")))
                .await
                .unwrap();
            db.enqueue(issue.id).await.unwrap();
        }

        let agent = Arc::new(CountingAgent {
            runs: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(3, deps(&db, agent.clone()), &CancellationToken::new());
        assert_eq!(pool.len(), 3);

        let deadline = Instant::now() + Duration::from_secs(10);
        while db.job_counts().await.unwrap().completed < 6 {
            assert!(Instant::now() < deadline, "queue did not drain");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let report = pool.shutdown(Duration::from_secs(2)).await;
        assert_eq!(report, ShutdownReport { drained: 3, aborted: 0 });
        assert_eq!(agent.runs.load(Ordering::SeqCst), 6);
        assert_eq!(
            db.list_jobs_by_status(JobStatus::Completed).await.unwrap().len(),
            6
        );
    }

    #[tokio::test]
    async fn shutdown_aborts_after_grace() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let issue = db.create_issue(&NewIssue::new(1, 1, "slow")).await.unwrap();
        let job = db.enqueue(issue.id).await.unwrap();

        let pool = WorkerPool::spawn(2, deps(&db, Arc::new(StubbornAgent)), &CancellationToken::new());
        let deadline = Instant::now() + Duration::from_secs(5);
        while db.get_job(job.id).await.unwrap().unwrap().status != JobStatus::Running {
            assert!(Instant::now() < deadline, "job was never claimed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let report = pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(report, ShutdownReport { drained: 1, aborted: 1 });
        assert_eq!(
            db.get_job(job.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn parent_cancel_stops_pool() {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let parent = CancellationToken::new();
        let agent = Arc::new(CountingAgent {
            runs: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(DEFAULT_WORKER_COUNT, deps(&db, agent), &parent);

        parent.cancel();
        let report = pool.shutdown(Duration::from_secs(2)).await;
        assert_eq!(report.drained, DEFAULT_WORKER_COUNT);
    }
}
