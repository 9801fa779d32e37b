//! libSQL backend — async `JobStore` / `IssueSink` implementation.
//!
//! Supports local file and in-memory databases. Cross-worker exclusion comes
//! from single-statement conditional updates: SQLite runs one writer at a
//! time, so an `UPDATE … WHERE id = (SELECT …) RETURNING` claim either takes
//! the row or sees it already taken and picks the next one. This holds for
//! several processes sharing the database file, not just tasks in one.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::issues::{Issue, IssueStatus, NewIssue, NewNotification, Notification, NotificationKind};
use crate::jobs::transition::JobEvent;
use crate::jobs::{DEFAULT_MAX_ATTEMPTS, Job, JobCounts, JobStatus};
use crate::store::migrations;
use crate::store::traits::{IssueSink, JobStore};

/// Longest delay we turn into a timestamp offset (100 years).
const MAX_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// How long a connection waits on another writer before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Attempt ceiling `enqueue` gives new jobs.
    default_max_attempts: u32,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        // The pragma answers with a row; step it so the setting applies.
        let mut rows = conn
            .query(
                &format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT.as_millis()),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to set busy timeout: {e}")))?;
        drop(rows);

        let backend = Self {
            db: Arc::new(db),
            conn,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Set the attempt ceiling used by `enqueue`.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a statement returning job rows and collect them.
    async fn query_jobs(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut jobs = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => jobs.push(row_to_job(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op} row: {e}"))),
            }
        }
        Ok(jobs)
    }

    /// Run a statement returning at most one job row.
    async fn query_job(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams + Send,
    ) -> Result<Option<Job>, DatabaseError> {
        Ok(self.query_jobs(op, sql, params).await?.into_iter().next())
    }

    /// Fetch a job only if it is still `running` at `attempt`.
    async fn owned_job(&self, job_id: i64, attempt: u32) -> Result<Option<Job>, DatabaseError> {
        let job = self.get_job(job_id).await?;
        Ok(job.filter(|j| j.status == JobStatus::Running && j.attempts == attempt))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so text comparison orders by time.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn offset(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d.min(MAX_OFFSET)).unwrap_or(TimeDelta::zero())
}

/// Map an INSERT error, turning the active-job unique index into a conflict.
fn insert_error(issue_id: i64, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Conflict(format!("issue {issue_id} already has an active job"))
    } else if msg.contains("FOREIGN KEY constraint failed") {
        DatabaseError::NotFound {
            entity: "issue".to_string(),
            id: issue_id.to_string(),
        }
    } else {
        DatabaseError::Query(format!("enqueue: {msg}"))
    }
}

fn column_u32(row: &libsql::Row, idx: i32, name: &str) -> Result<u32, DatabaseError> {
    let v: i64 = row
        .get(idx)
        .map_err(|e| DatabaseError::Query(format!("job.{name}: {e}")))?;
    u32::try_from(v).map_err(|e| DatabaseError::Serialization(format!("job.{name} = {v}: {e}")))
}

// ── Row mapping helpers for jobs ────────────────────────────────────

/// Column list for job SELECT / RETURNING clauses (11 columns).
const JOB_COLUMNS: &str = "id, issue_id, status, attempts, max_attempts, started_at, completed_at, error_msg, result, available_at, created_at";

fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("job.id: {e}")))?;
    let issue_id: i64 = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("job.issue_id: {e}")))?;
    let status_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("job.status: {e}")))?;
    let status: JobStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let created_str: String = row.get(10).unwrap_or_default();
    let available_str: String = row.get(9).unwrap_or_default();

    Ok(Job {
        id,
        issue_id,
        status,
        attempts: column_u32(row, 3, "attempts")?,
        max_attempts: column_u32(row, 4, "max_attempts")?,
        started_at: parse_optional_datetime(row.get(5).ok()),
        completed_at: parse_optional_datetime(row.get(6).ok()),
        error_msg: row.get(7).ok(),
        result: row.get(8).ok(),
        available_at: parse_datetime(&available_str),
        created_at: parse_datetime(&created_str),
    })
}

// ── Row mapping helpers for issues / notifications ──────────────────

const ISSUE_COLUMNS: &str = "id, project_id, user_id, title, body, status, ai_session_id, ai_result, created_at, updated_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, issue_id, type, title, message, read, created_at";

fn row_to_issue(row: &libsql::Row) -> Result<Issue, DatabaseError> {
    let status_str: String = row.get(5).unwrap_or_else(|_| "open".to_string());
    let created_str: String = row.get(8).unwrap_or_default();
    let updated_str: String = row.get(9).unwrap_or_default();

    Ok(Issue {
        id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("issue.id: {e}")))?,
        project_id: row.get(1).unwrap_or(0),
        user_id: row
            .get(2)
            .map_err(|e| DatabaseError::Query(format!("issue.user_id: {e}")))?,
        title: row
            .get(3)
            .map_err(|e| DatabaseError::Query(format!("issue.title: {e}")))?,
        body: row.get(4).ok(),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        ai_session_id: row.get(6).ok(),
        ai_result: row.get(7).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_notification(row: &libsql::Row) -> Result<Notification, DatabaseError> {
    let kind_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("notification.type: {e}")))?;
    let kind: NotificationKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    let created_str: String = row.get(7).unwrap_or_default();

    Ok(Notification {
        id: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("notification.id: {e}")))?,
        user_id: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("notification.user_id: {e}")))?,
        issue_id: row.get(2).ok(),
        kind,
        title: row.get(4).unwrap_or_default(),
        message: row.get(5).unwrap_or_default(),
        read: row.get::<i64>(6).unwrap_or(0) != 0,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementations ───────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.conn()
            .execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;
        migrations::run_migrations(self.conn()).await
    }

    // ── Queue ───────────────────────────────────────────────────────

    async fn enqueue(&self, issue_id: i64) -> Result<Job, DatabaseError> {
        self.enqueue_with(issue_id, self.default_max_attempts).await
    }

    async fn enqueue_with(&self, issue_id: i64, max_attempts: u32) -> Result<Job, DatabaseError> {
        if max_attempts == 0 {
            return Err(DatabaseError::Conflict(
                "enqueue: max_attempts must be at least 1".to_string(),
            ));
        }
        let now = fmt_ts(Utc::now());

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO jobs (issue_id, status, attempts, max_attempts, available_at, created_at)
                     VALUES (?1, 'pending', 0, ?2, ?3, ?3)
                     RETURNING {JOB_COLUMNS}"
                ),
                params![issue_id, max_attempts as i64, now],
            )
            .await
            .map_err(|e| insert_error(issue_id, e))?;

        let row = rows
            .next()
            .await
            .map_err(|e| insert_error(issue_id, e))?
            .ok_or_else(|| DatabaseError::Query("enqueue: no row returned".to_string()))?;
        let job = row_to_job(&row)?;

        debug!(job_id = job.id, issue_id, max_attempts, "Job enqueued");
        Ok(job)
    }

    /// The sub-select mirrors `next_status(Pending, Claim)`: pending, due, and
    /// with attempts left.
    async fn claim_next(&self) -> Result<Option<Job>, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let job = self
            .query_job(
                "claim_next",
                &format!(
                    "UPDATE jobs
                     SET status = 'running', started_at = ?1, attempts = attempts + 1
                     WHERE id = (
                         SELECT id FROM jobs
                         WHERE status = 'pending' AND available_at <= ?1 AND attempts < max_attempts
                         ORDER BY created_at ASC, id ASC
                         LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now],
            )
            .await?;

        if let Some(ref job) = job {
            debug!(job_id = job.id, issue_id = job.issue_id, attempt = job.attempts, "Job claimed");
        }
        Ok(job)
    }

    async fn commit_success(
        &self,
        job_id: i64,
        attempt: u32,
        result: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        let Some(job) = self.owned_job(job_id, attempt).await? else {
            return Ok(None);
        };
        job.next_status(JobEvent::Succeed)
            .map_err(|e| DatabaseError::Conflict(format!("commit_success: {e}")))?;

        let now = fmt_ts(Utc::now());
        let job = self
            .query_job(
                "commit_success",
                &format!(
                    "UPDATE jobs
                     SET status = 'completed', completed_at = ?1, result = ?2, error_msg = NULL
                     WHERE id = ?3 AND status = 'running' AND attempts = ?4
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now, result, job_id, attempt as i64],
            )
            .await?;

        debug!(job_id, attempt, committed = job.is_some(), "Job success committed");
        Ok(job)
    }

    async fn commit_failure(
        &self,
        job_id: i64,
        attempt: u32,
        error_msg: &str,
        retry_backoff: Duration,
    ) -> Result<Option<Job>, DatabaseError> {
        let Some(job) = self.owned_job(job_id, attempt).await? else {
            return Ok(None);
        };
        let target = job
            .next_status(JobEvent::Fail)
            .map_err(|e| DatabaseError::Conflict(format!("commit_failure: {e}")))?;

        let now = Utc::now();
        let job = match target {
            JobStatus::Pending => {
                let available_at = fmt_ts(now + offset(retry_backoff));
                self.query_job(
                    "commit_failure",
                    &format!(
                        "UPDATE jobs
                         SET status = 'pending', error_msg = ?1, available_at = ?2
                         WHERE id = ?3 AND status = 'running' AND attempts = ?4
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![error_msg, available_at, job_id, attempt as i64],
                )
                .await?
            }
            _ => {
                self.query_job(
                    "commit_failure",
                    &format!(
                        "UPDATE jobs
                         SET status = 'failed', error_msg = ?1, completed_at = ?2
                         WHERE id = ?3 AND status = 'running' AND attempts = ?4
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![error_msg, fmt_ts(now), job_id, attempt as i64],
                )
                .await?
            }
        };

        debug!(job_id, attempt, target = %target, committed = job.is_some(), "Job failure committed");
        Ok(job)
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<Job>, DatabaseError> {
        let now = Utc::now();
        let cutoff = fmt_ts(now - offset(older_than));

        let stale = self
            .query_jobs(
                "reclaim_stale",
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE status = 'running' AND started_at < ?1
                     ORDER BY started_at ASC"
                ),
                params![cutoff],
            )
            .await?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for job in stale {
            let target = match job.next_status(JobEvent::Reap) {
                Ok(target) => target,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Skipping stale job");
                    continue;
                }
            };
            let started_at = opt_text(job.started_at.map(fmt_ts).as_deref());
            let note = format!(
                "attempt {} abandoned: still running after {}s",
                job.attempts,
                older_than.as_secs()
            );

            // Guard on started_at too so a job re-claimed since the scan is left alone.
            let updated = match target {
                JobStatus::Pending => {
                    self.query_job(
                        "reclaim_stale",
                        &format!(
                            "UPDATE jobs
                             SET status = 'pending', available_at = ?1, error_msg = ?2
                             WHERE id = ?3 AND status = 'running' AND attempts = ?4 AND started_at = ?5
                             RETURNING {JOB_COLUMNS}"
                        ),
                        params![fmt_ts(now), note, job.id, job.attempts as i64, started_at],
                    )
                    .await?
                }
                _ => {
                    self.query_job(
                        "reclaim_stale",
                        &format!(
                            "UPDATE jobs
                             SET status = 'failed', completed_at = ?1, error_msg = ?2
                             WHERE id = ?3 AND status = 'running' AND attempts = ?4 AND started_at = ?5
                             RETURNING {JOB_COLUMNS}"
                        ),
                        params![fmt_ts(now), note, job.id, job.attempts as i64, started_at],
                    )
                    .await?
                }
            };

            if let Some(job) = updated {
                debug!(job_id = job.id, status = %job.status, "Stale job reclaimed");
                reclaimed.push(job);
            }
        }
        Ok(reclaimed)
    }

    // ── Read side ───────────────────────────────────────────────────

    async fn get_job(&self, job_id: i64) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "get_job",
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![job_id],
        )
        .await
    }

    async fn active_job_for_issue(&self, issue_id: i64) -> Result<Option<Job>, DatabaseError> {
        self.query_job(
            "active_job_for_issue",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE issue_id = ?1 AND status IN ('pending', 'running')"
            ),
            params![issue_id],
        )
        .await
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, DatabaseError> {
        self.query_jobs(
            "list_jobs_by_status",
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC"
            ),
            params![status.as_str()],
        )
        .await
    }

    async fn job_counts(&self) -> Result<JobCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM jobs GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("job_counts: {e}")))?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("job_counts row: {e}")))?
        {
            let status: String = row.get(0).unwrap_or_default();
            let n = row.get::<i64>(1).unwrap_or(0) as usize;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => counts.pending = n,
                Ok(JobStatus::Running) => counts.running = n,
                Ok(JobStatus::Completed) => counts.completed = n,
                Ok(JobStatus::Failed) => counts.failed = n,
                Err(e) => warn!(error = %e, "Unknown status in jobs table"),
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl IssueSink for LibSqlBackend {
    async fn create_issue(&self, issue: &NewIssue) -> Result<Issue, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO issues (project_id, user_id, title, body, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 'open', ?5, ?5)
                     RETURNING {ISSUE_COLUMNS}"
                ),
                params![
                    issue.project_id,
                    issue.user_id,
                    issue.title.as_str(),
                    opt_text(issue.body.as_deref()),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_issue: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("create_issue row: {e}")))?
            .ok_or_else(|| DatabaseError::Query("create_issue: no row returned".to_string()))?;
        let issue = row_to_issue(&row)?;
        debug!(issue_id = issue.id, "Issue created");
        Ok(issue)
    }

    async fn get_issue(&self, issue_id: i64) -> Result<Option<Issue>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ISSUE_COLUMNS} FROM issues WHERE id = ?1"),
                params![issue_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_issue: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_issue(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_issue row: {e}"))),
        }
    }

    async fn mark_issue_in_progress(&self, issue_id: i64) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE issues SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![IssueStatus::InProgress.as_str(), now, issue_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_issue_in_progress: {e}")))?;
        ensure_issue_changed(changed, issue_id)
    }

    async fn complete_issue(
        &self,
        issue_id: i64,
        session_id: &str,
        result: &str,
    ) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE issues SET status = ?1, ai_session_id = ?2, ai_result = ?3, updated_at = ?4 WHERE id = ?5",
                params![
                    IssueStatus::Completed.as_str(),
                    session_id,
                    result,
                    now,
                    issue_id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_issue: {e}")))?;
        ensure_issue_changed(changed, issue_id)
    }

    async fn close_issue(&self, issue_id: i64, diagnostic: &str) -> Result<(), DatabaseError> {
        let now = fmt_ts(Utc::now());
        let changed = self
            .conn()
            .execute(
                "UPDATE issues SET status = ?1, ai_result = ?2, updated_at = ?3 WHERE id = ?4",
                params![IssueStatus::Closed.as_str(), diagnostic, now, issue_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("close_issue: {e}")))?;
        ensure_issue_changed(changed, issue_id)
    }

    async fn append_notification(
        &self,
        notification: &NewNotification,
    ) -> Result<Notification, DatabaseError> {
        let now = fmt_ts(Utc::now());
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO notifications (user_id, issue_id, type, title, message, read, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
                     RETURNING {NOTIFICATION_COLUMNS}"
                ),
                params![
                    notification.user_id,
                    opt_int(notification.issue_id),
                    notification.kind.as_str(),
                    notification.title.as_str(),
                    notification.message.as_str(),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_notification: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("append_notification row: {e}")))?
            .ok_or_else(|| {
                DatabaseError::Query("append_notification: no row returned".to_string())
            })?;
        let stored = row_to_notification(&row)?;
        debug!(
            notification_id = stored.id,
            issue_id = ?stored.issue_id,
            kind = %stored.kind,
            "Notification appended"
        );
        Ok(stored)
    }

    async fn list_notifications(&self, issue_id: i64) -> Result<Vec<Notification>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE issue_id = ?1 ORDER BY id ASC"
                ),
                params![issue_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_notifications: {e}")))?;

        let mut notifications = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_notifications row: {e}")))?
        {
            notifications.push(row_to_notification(&row)?);
        }
        Ok(notifications)
    }
}

fn ensure_issue_changed(changed: u64, issue_id: i64) -> Result<(), DatabaseError> {
    if changed == 0 {
        return Err(DatabaseError::NotFound {
            entity: "issue".to_string(),
            id: issue_id.to_string(),
        });
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn make_issue(db: &LibSqlBackend, title: &str) -> Issue {
        db.create_issue(&NewIssue::new(1, 7, title).with_body("details"))
            .await
            .unwrap()
    }

    async fn enqueued(db: &LibSqlBackend, title: &str) -> Job {
        let issue = make_issue(db, title).await;
        db.enqueue(issue.id).await.unwrap()
    }

    // ── Enqueue ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn enqueue_creates_pending_job() {
        let db = test_db().await;
        let job = enqueued(&db, "a").await;

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert_eq!(db.get_job(job.id).await.unwrap().unwrap(), job);
    }

    #[tokio::test]
    async fn enqueue_conflicts_with_active_job() {
        let db = test_db().await;
        let job = enqueued(&db, "a").await;

        let err = db.enqueue(job.issue_id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)), "got {err:?}");

        // Still conflicting while running.
        db.claim_next().await.unwrap().unwrap();
        assert!(matches!(
            db.enqueue(job.issue_id).await,
            Err(DatabaseError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_allowed_after_terminal_job() {
        let db = test_db().await;
        let job = enqueued(&db, "a").await;
        let claimed = db.claim_next().await.unwrap().unwrap();
        db.commit_success(claimed.id, claimed.attempts, "done")
            .await
            .unwrap()
            .unwrap();

        let again = db.enqueue(job.issue_id).await.unwrap();
        assert_ne!(again.id, job.id);
        assert_eq!(
            db.active_job_for_issue(job.issue_id).await.unwrap().unwrap().id,
            again.id
        );
    }

    #[tokio::test]
    async fn enqueue_unknown_issue_fails() {
        let db = test_db().await;
        let err = db.enqueue(9999).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn enqueue_uses_configured_ceiling() {
        let db = test_db().await.with_default_max_attempts(5);
        let job = enqueued(&db, "a").await;
        assert_eq!(job.max_attempts, 5);
    }

    #[tokio::test]
    async fn enqueue_rejects_zero_attempts() {
        let db = test_db().await;
        let issue = make_issue(&db, "a").await;
        assert!(db.enqueue_with(issue.id, 0).await.is_err());
    }

    // ── Claim ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_marks_running_and_counts_attempt() {
        let db = test_db().await;
        let job = enqueued(&db, "a").await;

        let claimed = db.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        // Nothing left to claim.
        assert!(db.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_is_fifo_by_creation() {
        let db = test_db().await;
        let a = enqueued(&db, "a").await;
        let b = enqueued(&db, "b").await;

        assert_eq!(db.claim_next().await.unwrap().unwrap().id, a.id);
        assert_eq!(db.claim_next().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn concurrent_claims_never_share_a_job() {
        let db = Arc::new(test_db().await);
        for i in 0..5 {
            enqueued(&db, &format!("issue {i}")).await;
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move { db.claim_next().await.unwrap() }));
        }

        let mut claimed = Vec::new();
        for h in handles {
            if let Some(job) = h.await.unwrap() {
                claimed.push(job.id);
            }
        }
        let unique: HashSet<i64> = claimed.iter().copied().collect();
        assert_eq!(claimed.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    // ── Commit ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn commit_success_completes_job() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let claimed = db.claim_next().await.unwrap().unwrap();

        let done = db
            .commit_success(claimed.id, claimed.attempts, "all good")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result.as_deref(), Some("all good"));
        assert!(done.error_msg.is_none());
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn commit_success_clears_previous_error() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let first = db.claim_next().await.unwrap().unwrap();
        db.commit_failure(first.id, first.attempts, "boom", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let second = db.claim_next().await.unwrap().unwrap();
        let done = db
            .commit_success(second.id, second.attempts, "ok")
            .await
            .unwrap()
            .unwrap();
        assert!(done.error_msg.is_none());
    }

    #[tokio::test]
    async fn commit_failure_retries_then_fails() {
        let db = test_db().await;
        enqueued(&db, "a").await;

        for attempt in 1..=3u32 {
            let claimed = db.claim_next().await.unwrap().unwrap();
            assert_eq!(claimed.attempts, attempt);
            let after = db
                .commit_failure(claimed.id, attempt, &format!("fail {attempt}"), Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(after.error_msg.as_deref(), Some(format!("fail {attempt}").as_str()));
            if attempt < 3 {
                assert_eq!(after.status, JobStatus::Pending);
                assert!(after.completed_at.is_none());
            } else {
                assert_eq!(after.status, JobStatus::Failed);
                assert!(after.completed_at.is_some());
            }
        }

        assert!(db.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_backoff_delays_reclaim() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let claimed = db.claim_next().await.unwrap().unwrap();
        db.commit_failure(claimed.id, 1, "boom", Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();

        assert!(db.claim_next().await.unwrap().is_none());
        assert_eq!(db.job_counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn backed_off_job_does_not_block_younger_jobs() {
        let db = test_db().await;
        let a = enqueued(&db, "a").await;
        let b = enqueued(&db, "b").await;

        let claimed = db.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);
        db.commit_failure(a.id, 1, "boom", Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(db.claim_next().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let claimed = db.claim_next().await.unwrap().unwrap();
        let done = db
            .commit_success(claimed.id, 1, "ok")
            .await
            .unwrap()
            .unwrap();

        assert!(db.commit_failure(done.id, 1, "late", Duration::ZERO).await.unwrap().is_none());
        assert!(db.commit_success(done.id, 1, "again").await.unwrap().is_none());
        assert!(db.claim_next().await.unwrap().is_none());
        assert!(db.reclaim_stale(Duration::ZERO).await.unwrap().is_empty());

        assert_eq!(db.get_job(done.id).await.unwrap().unwrap(), done);
    }

    #[tokio::test]
    async fn commit_with_stale_attempt_is_ignored() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let first = db.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        db.reclaim_stale(Duration::from_millis(1)).await.unwrap();
        let second = db.claim_next().await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);

        // The first worker wakes up late; its commit must not land.
        assert!(db.commit_success(first.id, first.attempts, "late").await.unwrap().is_none());
        let current = db.get_job(first.id).await.unwrap().unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.attempts, 2);
    }

    #[tokio::test]
    async fn commit_on_pending_job_is_ignored() {
        let db = test_db().await;
        let job = enqueued(&db, "a").await;
        assert!(db.commit_success(job.id, 0, "nope").await.unwrap().is_none());
        assert!(db.commit_failure(job.id, 0, "nope", Duration::ZERO).await.unwrap().is_none());
    }

    // ── Reaper ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn reclaim_stale_requeues_without_counting_attempt() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let claimed = db.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = db.reclaim_stale(Duration::from_millis(1)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed.id);
        assert_eq!(reclaimed[0].status, JobStatus::Pending);
        assert_eq!(reclaimed[0].attempts, 1);

        let again = db.claim_next().await.unwrap().unwrap();
        assert_eq!(again.id, claimed.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn reclaim_stale_leaves_live_jobs_alone() {
        let db = test_db().await;
        enqueued(&db, "a").await;
        let claimed = db.claim_next().await.unwrap().unwrap();

        let reclaimed = db.reclaim_stale(Duration::from_secs(3600)).await.unwrap();
        assert!(reclaimed.is_empty());
        assert_eq!(
            db.get_job(claimed.id).await.unwrap().unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn reclaim_stale_fails_exhausted_job() {
        let db = test_db().await;
        let issue = make_issue(&db, "a").await;
        db.enqueue_with(issue.id, 1).await.unwrap();
        db.claim_next().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = db.reclaim_stale(Duration::from_millis(1)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, JobStatus::Failed);
        assert_eq!(reclaimed[0].attempts, 1);
        assert!(reclaimed[0].completed_at.is_some());
    }

    // ── Read side ───────────────────────────────────────────────────

    #[tokio::test]
    async fn counts_and_listing() {
        let db = test_db().await;
        let a = enqueued(&db, "a").await;
        enqueued(&db, "b").await;
        enqueued(&db, "c").await;
        let claimed = db.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);

        let counts = db.job_counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.running, 1);
        assert_eq!(counts.total(), 3);

        let pending = db.list_jobs_by_status(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].created_at <= pending[1].created_at);
    }

    // ── Issues & notifications ──────────────────────────────────────

    #[tokio::test]
    async fn issue_lifecycle_fields() {
        let db = test_db().await;
        let issue = make_issue(&db, "a").await;
        assert_eq!(issue.status, IssueStatus::Open);
        assert_eq!(issue.body.as_deref(), Some("details"));

        db.mark_issue_in_progress(issue.id).await.unwrap();
        assert_eq!(
            db.get_issue(issue.id).await.unwrap().unwrap().status,
            IssueStatus::InProgress
        );

        db.complete_issue(issue.id, "sess-1", "patched").await.unwrap();
        let done = db.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(done.status, IssueStatus::Completed);
        assert_eq!(done.ai_session_id.as_deref(), Some("sess-1"));
        assert_eq!(done.ai_result.as_deref(), Some("patched"));
    }

    #[tokio::test]
    async fn close_issue_stores_diagnostic() {
        let db = test_db().await;
        let issue = make_issue(&db, "a").await;
        db.close_issue(issue.id, "agent exited with code 1").await.unwrap();

        let closed = db.get_issue(issue.id).await.unwrap().unwrap();
        assert_eq!(closed.status, IssueStatus::Closed);
        assert_eq!(closed.ai_result.as_deref(), Some("agent exited with code 1"));
        assert!(closed.ai_session_id.is_none());
    }

    #[tokio::test]
    async fn updating_missing_issue_is_not_found() {
        let db = test_db().await;
        assert!(matches!(
            db.mark_issue_in_progress(404).await,
            Err(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn notifications_append_and_list() {
        let db = test_db().await;
        let issue = make_issue(&db, "a").await;

        let n = db
            .append_notification(&NewNotification::ai_started(&issue, 1, 3))
            .await
            .unwrap();
        assert_eq!(n.kind, NotificationKind::AiStarted);
        assert_eq!(n.user_id, 7);
        assert!(!n.read);

        db.append_notification(&NewNotification::issue_completed(&issue, "ok"))
            .await
            .unwrap();

        let all = db.list_notifications(issue.id).await.unwrap();
        let kinds: Vec<NotificationKind> = all.iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NotificationKind::AiStarted, NotificationKind::IssueCompleted]
        );
    }

    #[tokio::test]
    async fn open_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("dispatch.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(path.exists());
        enqueued(&db, "a").await;
    }

    #[test]
    fn timestamps_sort_as_text() {
        let early = Utc::now();
        let late = early + TimeDelta::milliseconds(1);
        assert!(fmt_ts(early) < fmt_ts(late));
        assert_eq!(fmt_ts(early).len(), fmt_ts(late).len());
        assert_eq!(parse_datetime(&fmt_ts(early)).timestamp_micros(), early.timestamp_micros());
    }
}
