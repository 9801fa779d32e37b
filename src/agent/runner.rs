//! Agent runner — one external agent process per attempt.
//!
//! `CommandAgent` provides:
//! - Prompt delivery on stdin
//! - A hard wall-clock deadline
//! - Process-group kill so helpers the agent spawned die with it
//! - Capped, concurrent stdout/stderr capture that survives a kill

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::report::parse_report;
use crate::config::DispatchConfig;
use crate::error::AgentError;

/// Maximum bytes kept per output stream (64KB). The tail is kept.
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Largest final report kept whole on stdout, however much precedes it.
const MAX_REPORT_SIZE: usize = 32 * 1024 * 1024;

/// Longest stretch of output quoted in a job's `error_msg`.
const MAX_ERROR_OUTPUT: usize = 4 * 1024;

/// How long to wait for the pipes to drain once the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default agent deadline.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What the agent is asked to do.
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub job_id: i64,
    pub issue_id: i64,
    pub attempt: u32,
    /// Issue title, blank line, issue body.
    pub prompt: String,
}

/// How one agent run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentOutcome {
    /// Exited zero and printed a usable report.
    Success { session_id: String, result: String },
    /// Could not start, exited non-zero, died on a signal, or reported an error.
    Failure {
        exit_code: Option<i32>,
        output: String,
    },
    /// Hit the deadline and was killed.
    Timeout {
        after: Duration,
        partial_output: String,
    },
    /// Killed because the dispatcher is shutting down.
    Cancelled { partial_output: String },
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Text recorded as the job's `error_msg`.
    ///
    /// `None` for `Success` and `Cancelled`, which are not failed attempts.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Success { .. } | Self::Cancelled { .. } => None,
            Self::Failure {
                exit_code: Some(code),
                output,
            } if *code != 0 => Some(with_output(
                AgentError::NonZeroExit { code: *code }.to_string(),
                output,
            )),
            Self::Failure { output, .. } => Some(tail(output.trim(), MAX_ERROR_OUTPUT)),
            Self::Timeout {
                after,
                partial_output,
            } => Some(with_output(
                AgentError::Timeout { timeout: *after }.to_string(),
                partial_output,
            )),
        }
    }
}

/// Runs the agent for one attempt.
///
/// Never returns an error: every way a run can end is an `AgentOutcome`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, task: &AgentTask, cancel: &CancellationToken) -> AgentOutcome;
}

/// Runs an external command as the agent.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    binary: String,
    args: Vec<String>,
    /// Working directory (if None, inherits cwd).
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        let agent = Self::new(config.agent_binary.clone())
            .with_args(config.agent_args.clone())
            .with_timeout(config.agent_timeout);
        match &config.agent_workdir {
            Some(dir) => agent.with_working_dir(dir.clone()),
            None => agent,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        // Own process group, so the whole tree can be signalled at once.
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

/// How the wait for the child ended.
enum Ended {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl AgentRunner for CommandAgent {
    async fn run(&self, task: &AgentTask, cancel: &CancellationToken) -> AgentOutcome {
        let mut child = match self.command().spawn() {
            Ok(child) => child,
            Err(e) => {
                return AgentOutcome::Failure {
                    exit_code: None,
                    output: AgentError::StartFailed {
                        reason: format!("{}: {e}", self.binary),
                    }
                    .to_string(),
                };
            }
        };
        let pid = child.id();
        debug!(job_id = task.job_id, attempt = task.attempt, pid = ?pid, "Agent started");

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = task.prompt.clone();
            let job_id = task.job_id;
            tokio::spawn(async move {
                // Dropping stdin afterwards sends EOF.
                if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                    debug!(job_id, error = %e, "Agent did not read the whole prompt");
                }
            });
        }

        let stdout = Capture::spawn(child.stdout.take(), OutputBuffer::keeping_report());
        let stderr = Capture::spawn(child.stderr.take(), OutputBuffer::tail());

        let ended = tokio::select! {
            status = child.wait() => Ended::Exited(status),
            _ = tokio::time::sleep(self.timeout) => Ended::TimedOut,
            _ = cancel.cancelled() => Ended::Cancelled,
        };

        if matches!(ended, Ended::Exited(_)) {
            // Helpers left behind would keep the pipes open.
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
        } else {
            kill_tree(&mut child, pid).await;
        }

        let stdout = stdout.finish().await;
        let stderr = stderr.finish().await;

        match ended {
            Ended::TimedOut => {
                warn!(job_id = task.job_id, timeout = ?self.timeout, "Agent timed out");
                AgentOutcome::Timeout {
                    after: self.timeout,
                    partial_output: combine(&stdout, &stderr),
                }
            }
            Ended::Cancelled => AgentOutcome::Cancelled {
                partial_output: combine(&stdout, &stderr),
            },
            Ended::Exited(Err(e)) => AgentOutcome::Failure {
                exit_code: None,
                output: with_output(
                    format!("Failed to wait for agent: {e}"),
                    &combine(&stdout, &stderr),
                ),
            },
            Ended::Exited(Ok(status)) => outcome_from_exit(status, &stdout, &stderr),
        }
    }
}

fn outcome_from_exit(status: ExitStatus, stdout: &str, stderr: &str) -> AgentOutcome {
    match status.code() {
        Some(0) => match parse_report(stdout) {
            Ok(report) if !report.is_error => AgentOutcome::Success {
                session_id: report.session_id,
                result: report.result,
            },
            Ok(report) => AgentOutcome::Failure {
                exit_code: Some(0),
                output: with_output("Agent reported an error".to_string(), &report.result),
            },
            Err(e) => AgentOutcome::Failure {
                exit_code: Some(0),
                output: with_output(e.to_string(), &combine(stdout, stderr)),
            },
        },
        Some(code) => AgentOutcome::Failure {
            exit_code: Some(code),
            output: combine(stdout, stderr),
        },
        None => AgentOutcome::Failure {
            exit_code: None,
            output: with_output(AgentError::Killed.to_string(), &combine(stdout, stderr)),
        },
    }
}

/// SIGKILL the agent's process group, then the child itself.
async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Agent already gone");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: killpg only sends a signal. The group id equals the child's pid
    // because it was spawned with process_group(0).
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Bytes read from one output stream, bounded to `MAX_OUTPUT_SIZE`.
///
/// In report mode the last line starting with `{` is never cut, so a final
/// JSON report larger than the tail budget still parses.
#[derive(Debug, Default)]
struct OutputBuffer {
    bytes: Vec<u8>,
    keep_report: bool,
    /// Offset of the last line that starts with `{`.
    report_start: Option<usize>,
    /// Whether the next byte begins a line.
    at_line_start: bool,
}

impl OutputBuffer {
    fn tail() -> Self {
        Self::default()
    }

    fn keeping_report() -> Self {
        Self {
            keep_report: true,
            at_line_start: true,
            ..Self::default()
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.keep_report {
            let base = self.bytes.len();
            for (i, &byte) in chunk.iter().enumerate() {
                if self.at_line_start && byte == b'{' {
                    self.report_start = Some(base + i);
                }
                self.at_line_start = byte == b'\n';
            }
        }
        self.bytes.extend_from_slice(chunk);

        if self.bytes.len() <= MAX_OUTPUT_SIZE {
            return;
        }
        let excess = self.bytes.len() - MAX_OUTPUT_SIZE;
        let cut = match self.report_start {
            Some(start) if start < excess && self.bytes.len() - start <= MAX_REPORT_SIZE => start,
            _ => excess,
        };
        self.bytes.drain(..cut);
        self.report_start = self.report_start.and_then(|start| start.checked_sub(cut));
    }

    fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Background reader for one output stream.
struct Capture {
    buf: Arc<Mutex<OutputBuffer>>,
    handle: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(reader: Option<R>, buffer: OutputBuffer) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(buffer));
        let handle = reader.map(|mut reader| {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let Ok(mut buf) = buf.lock() else { break };
                            buf.push(&chunk[..n]);
                        }
                    }
                }
            })
        });
        Self { buf, handle }
    }

    /// Wait briefly for EOF, then return whatever was read.
    async fn finish(mut self) -> String {
        if let Some(mut handle) = self.handle.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
                // A descendant outside the process group still holds the pipe.
                handle.abort();
            }
        }
        match self.buf.lock() {
            Ok(buf) => buf.to_text(),
            Err(_) => String::new(),
        }
    }
}

/// Both streams for diagnostics, each cut to its last `MAX_OUTPUT_SIZE` bytes.
fn combine(stdout: &str, stderr: &str) -> String {
    let stdout = tail(stdout.trim_end(), MAX_OUTPUT_SIZE);
    let stderr = tail(stderr.trim_end(), MAX_OUTPUT_SIZE);
    let (stdout, stderr) = (stdout.as_str(), stderr.as_str());
    if stderr.is_empty() {
        stdout.to_string()
    } else if stdout.is_empty() {
        stderr.to_string()
    } else {
        format!("{stdout}\n\n--- stderr ---\n{stderr}")
    }
}

fn with_output(head: String, output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        head
    } else {
        format!("{head}\n{}", tail(output, MAX_ERROR_OUTPUT))
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
