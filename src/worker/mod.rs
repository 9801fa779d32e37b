//! Worker system — turning queued jobs into agent runs.
//!
//! Core components:
//! - `worker` — claim → execute → commit → project loop
//! - `pool` — fixed-size set of workers with graceful shutdown
//! - `reaper` — returns jobs orphaned by dead workers to the queue
//! - `projection` — issue and notification writes that follow a commit

pub mod pool;
pub mod projection;
pub mod reaper;
pub mod worker;

pub use pool::{DEFAULT_WORKER_COUNT, ShutdownReport, WorkerPool};
pub use reaper::{reap_once, spawn_reaper};
pub use worker::{CycleOutcome, Worker, WorkerDeps, WorkerState};
