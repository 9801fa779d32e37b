//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Extra headroom the reaper gives a job beyond the agent deadline.
const STALE_HEADROOM: Duration = Duration::from_secs(300);

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Optional directory for a daily rolling log file.
    pub log_dir: Option<PathBuf>,
    /// Agent executable.
    pub agent_binary: String,
    /// Arguments passed to the agent before the prompt is piped to stdin.
    pub agent_args: Vec<String>,
    /// Working directory the agent runs in (if None, inherits cwd).
    pub agent_workdir: Option<PathBuf>,
    /// Hard wall-clock deadline for one agent run.
    pub agent_timeout: Duration,
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Attempts a new job gets before it fails.
    pub max_attempts: u32,
    /// Sleep between claims when the queue is empty.
    pub poll_interval: Duration,
    /// Delay before a failed attempt becomes claimable again.
    pub retry_backoff: Duration,
    /// How often the reaper scans for stuck jobs.
    pub reaper_interval: Duration,
    /// A running job older than this is presumed orphaned.
    pub reaper_stale_after: Duration,
    /// How long shutdown waits for in-flight work before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let agent_timeout = Duration::from_secs(30 * 60);
        Self {
            db_path: PathBuf::from("./data/issue-dispatch.db"),
            log_dir: None,
            agent_binary: "claude".to_string(),
            agent_args: default_agent_args(),
            agent_workdir: None,
            agent_timeout,
            worker_count: 3,
            max_attempts: 3,
            poll_interval: Duration::from_millis(2000),
            retry_backoff: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(60),
            reaper_stale_after: agent_timeout + STALE_HEADROOM,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

fn default_agent_args() -> Vec<String> {
    ["-p", "--output-format", "json"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl DispatchConfig {
    /// Build a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let agent_timeout = match parse_env(&lookup, "AGENT_TIMEOUT_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => match lookup("CLAUDE_CODE_TIMEOUT").filter(|s| !s.trim().is_empty()) {
                Some(raw) => parse_duration(raw.trim())
                    .map_err(|e| invalid("CLAUDE_CODE_TIMEOUT", &format!("{raw:?}: {e}")))?,
                None => defaults.agent_timeout,
            },
        };

        let reaper_stale_after = parse_env(&lookup, "REAPER_STALE_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(agent_timeout + STALE_HEADROOM);

        let agent_args = lookup("AGENT_ARGS")
            .map(|s| s.split_whitespace().map(|a| a.to_string()).collect())
            .unwrap_or(defaults.agent_args);

        let config = Self {
            db_path: lookup("DISPATCH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: lookup("DISPATCH_LOG_DIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            agent_binary: lookup("AGENT_BINARY")
                .or_else(|| lookup("CLAUDE_CODE_BINARY"))
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.agent_binary),
            agent_args,
            agent_workdir: lookup("AGENT_WORKDIR")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            agent_timeout,
            worker_count: parse_env(&lookup, "AI_WORKER_COUNT")?
                .unwrap_or(defaults.worker_count),
            max_attempts: parse_env(&lookup, "JOB_MAX_ATTEMPTS")?
                .unwrap_or(defaults.max_attempts),
            poll_interval: parse_env(&lookup, "POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            retry_backoff: parse_env(&lookup, "RETRY_BACKOFF_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_backoff),
            reaper_interval: parse_env(&lookup, "REAPER_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reaper_interval),
            reaper_stale_after,
            shutdown_grace: parse_env(&lookup, "SHUTDOWN_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(invalid("AI_WORKER_COUNT", "must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("JOB_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.reaper_interval.is_zero() {
            return Err(invalid("REAPER_INTERVAL_SECS", "must be greater than 0"));
        }
        // A threshold at or under the deadline would reclaim jobs that are still running.
        if self.reaper_stale_after <= self.agent_timeout {
            return Err(invalid(
                "REAPER_STALE_SECS",
                &format!(
                    "must exceed the agent timeout ({}s)",
                    self.agent_timeout.as_secs()
                ),
            ));
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, &format!("{raw:?}: {e}"))),
    }
}

/// Parse a unit-suffixed duration such as `90s`, `30m` or `1h30m`.
///
/// Accepts the units `ns`, `us`, `µs`, `ms`, `s`, `m` and `h`, with optional
/// fractions (`1.5h`). A bare `0` is zero.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total_nanos = 0f64;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("expected a number at {rest:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("bad number {:?}", &rest[..number_len]))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in {raw:?}")),
            unit => return Err(format!("unknown unit {unit:?}")),
        };
        rest = &rest[unit_len..];
        total_nanos += value * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(format!("{raw:?} is out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
