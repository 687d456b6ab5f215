//! Generation job tracking for Diffusion Orchestrator
//!
//! This crate bounds the number of simultaneous generation jobs and tracks
//! per-job state: status text, cancellation and skip requests, recorded
//! previews and the on-demand preview rendezvous between observers and the
//! job's worker.

pub mod context;
pub mod job;
pub mod manager;
pub mod slots;

// Re-export commonly used types
pub use context::JobContext;
pub use job::{JobInfo, JobOptions, JobResult, JobSnapshot};
pub use manager::{JobHandle, JobManager};
pub use slots::{JobSlot, JobSlotPool, SlotPolicy};
