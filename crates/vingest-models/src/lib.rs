//! Shared data models for the vingest import pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Import jobs, their immutable spec and queue state
//! - Progress reporting (stages, egress attempts, selected quality)
//! - The failure taxonomy that drives retry decisions
//! - Recovery mirror records used for crash recovery
//! - Filename and object-name helpers

pub mod failure;
pub mod job;
pub mod progress;
pub mod recovery;
pub mod utils;

// Re-export common types
pub use failure::FailureKind;
pub use job::{ImportJob, ImportResult, ImportSpec, JobId, JobState, SourceKind};
pub use progress::{EgressAttempt, Progress, ProgressStage, SelectedQuality};
pub use recovery::{RecoveryRecord, RecoveryStatus};
pub use utils::{nonce, object_name_with_nonce, sanitize_file_name, split_file_name};
