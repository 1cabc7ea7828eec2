mod error;
mod runner;
mod scheduler;
mod tracker;

pub use error::JobError;
pub use runner::{AutoSyncStatus, ConnectionTestResult, SyncRunner, AUTO_SYNC_JOB_ID};
pub use scheduler::{clamp_interval, Scheduler};
pub use tracker::{JobState, JobTracker, JobUpdate};
