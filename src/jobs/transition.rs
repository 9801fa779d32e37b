//! Job state machine.
//!
//! `pending → running → {completed | pending (retry) | failed}`. Every status
//! change the store makes is first checked here, so the attempts-vs-ceiling
//! rule has exactly one home.

use crate::error::JobError;
use crate::jobs::model::JobStatus;

/// Something that happens to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEvent {
    /// A worker took the job; this counts as an attempt.
    Claim,
    /// The agent run succeeded and the result was parsed.
    Succeed,
    /// The attempt failed (start failure, timeout, non-zero exit, bad output).
    Fail,
    /// The reaper found the job running past the staleness threshold.
    Reap,
}

impl std::fmt::Display for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Claim => "claim",
            Self::Succeed => "succeed",
            Self::Fail => "fail",
            Self::Reap => "reap",
        };
        f.write_str(s)
    }
}

/// Compute the status a job moves to.
///
/// `attempts` is the count *before* the event; a claim is what increments it.
/// Reaping does not touch the counter, but a job whose budget is already
/// spent cannot go back to pending, so it fails instead.
pub fn next_status(
    from: JobStatus,
    attempts: u32,
    max_attempts: u32,
    event: JobEvent,
) -> Result<JobStatus, JobError> {
    use JobEvent::*;
    use JobStatus::*;

    match (from, event) {
        (Pending, Claim) if attempts < max_attempts => Ok(Running),
        (Pending, Claim) => Err(JobError::AttemptsExhausted { max_attempts }),
        (Running, Succeed) => Ok(Completed),
        (Running, Fail) | (Running, Reap) if attempts < max_attempts => Ok(Pending),
        (Running, Fail) | (Running, Reap) => Ok(Failed),
        (from, event) => Err(JobError::InvalidTransition {
            from: from.to_string(),
            event: event.to_string(),
        }),
    }
}
