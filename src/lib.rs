//! Issue Dispatch — durable job queue that runs a coding agent per issue.

pub mod agent;
pub mod config;
pub mod error;
pub mod issues;
pub mod jobs;
pub mod shutdown;
pub mod store;
pub mod worker;
