//! Redis-backed job store for the import pipeline.
//!
//! This crate provides:
//! - Durable job submission with request-id idempotency
//! - Worker leasing with lock renewal and stall accounting
//! - Exponential re-arm of retryable failures via a delayed set
//! - Admin controls (pause/resume/drain/obliterate) and queries
//! - The per-active-job recovery mirror with temp-file tracking

pub mod error;
pub mod queue;
pub mod recovery;

pub use error::{QueueError, QueueResult};
pub use queue::{ImportQueue, QueueConfig, StatusCounts};
pub use recovery::RecoveryStore;
