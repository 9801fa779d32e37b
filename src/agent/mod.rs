//! Agent execution — running the external coding agent for one attempt.

pub mod report;
pub mod runner;

pub use report::{AgentReport, parse_report};
pub use runner::{AgentOutcome, AgentRunner, AgentTask, CommandAgent};
