//! Parsing the agent's structured result from its stdout.
//!
//! The agent prints a JSON object carrying at least `session_id` and `result`
//! (`--output-format json`). With streaming output several objects are
//! printed one per line, and the last one that carries both fields wins.

use serde::Deserialize;

use crate::error::AgentError;

/// The final report an agent run prints.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentReport {
    pub session_id: String,
    pub result: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Extract the last complete report from `stdout`.
pub fn parse_report(stdout: &str) -> Result<AgentReport, AgentError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(AgentError::UnparsableOutput {
            reason: "no output".to_string(),
        });
    }

    // Whole output as a single (possibly pretty-printed) object.
    if let Ok(report) = serde_json::from_str::<AgentReport>(trimmed) {
        return Ok(report);
    }

    // One object per line; scan from the end.
    let mut last_error = None;
    for line in trimmed.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        match serde_json::from_str::<AgentReport>(line) {
            Ok(report) => return Ok(report),
            Err(e) => {
                last_error.get_or_insert(e);
            }
        }
    }

    Err(AgentError::UnparsableOutput {
        reason: match last_error {
            Some(e) => format!("no report with session_id and result ({e})"),
            None => "no JSON object in output".to_string(),
        },
    })
}
