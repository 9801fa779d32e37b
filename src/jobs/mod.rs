//! Jobs — one unit of agent work per issue, retried up to a ceiling.

pub mod model;
pub mod transition;

pub use model::{DEFAULT_MAX_ATTEMPTS, Job, JobCounts, JobStatus};
pub use transition::{JobEvent, next_status};
