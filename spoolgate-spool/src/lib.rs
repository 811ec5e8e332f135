//! Durable on-disk job queue.
//!
//! A job is one JSON file; its state is the directory holding it. The store
//! admits jobs, answers idempotency questions and performs the single-rename
//! state transitions. The retention sweeper bounds how much terminal state
//! accumulates under the spool root.

pub mod config;
pub mod error;
pub mod idempotency;
pub mod job;
pub mod retention;
pub mod store;
pub mod types;

pub use config::SpoolConfig;
pub use error::{Result, SpoolError, ValidationError};
pub use idempotency::IdempotencyIndex;
pub use job::{EmailRequest, Job, JobMeta, idem_key, stable_request_id};
pub use retention::{LogRetention, RetentionConfig, RetentionSweeper, SweepCounts, SweepReport};
pub use store::{EnqueueOutcome, EnqueueStatus, SpoolStats, SpoolStore};
pub use types::{JobHandle, JobId, SpoolState};
