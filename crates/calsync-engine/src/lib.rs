mod conflict;
mod decision;
mod engine;
mod error;
mod export;
mod ingest;
mod resolution;

#[cfg(test)]
pub(crate) mod testutil;

pub use conflict::{conflict_details, sync_state};
pub use decision::{decide, Decision, SkipReason};
pub use engine::SyncEngine;
pub use error::EngineError;
pub use export::ProgressFn;
pub use resolution::{ConflictResolution, MergeSide};
