//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by the model repository,
//! the job manager and their callers.

use thiserror::Error;

use crate::models::{Device, JobId};

/// Result type for Diffusion Orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Diffusion Orchestrator operations
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A loader with this name is already registered
    #[error("Model loader already registered: {0}")]
    DuplicateLoader(String),

    /// No loader is registered under this name
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Materializing a model failed
    #[error("Failed to load model {name}: {reason}")]
    ModelLoad {
        /// Loader name
        name: String,
        /// Underlying failure
        reason: String,
    },

    /// No set of idle residents can free enough room for the model
    #[error(
        "Insufficient capacity on {device} for model {name}: requires {required} units, \
         {reclaimable} reclaimable of {capacity}"
    )]
    InsufficientCapacity {
        /// Loader name
        name: String,
        /// Target device
        device: Device,
        /// Cost of the requested model
        required: u64,
        /// Free capacity plus the cost of every idle resident
        reclaimable: u64,
        /// Total capacity of the device budget
        capacity: u64,
    },

    /// The model still has outstanding handles
    #[error("Model {name} is in use by {handles} handle(s)")]
    ModelInUse {
        /// Loader name
        name: String,
        /// Outstanding handles
        handles: usize,
    },

    /// Every job slot is taken and the policy does not wait
    #[error("Job pool exhausted: all {max_jobs} slot(s) are in use")]
    PoolExhausted {
        /// Configured maximum of concurrent jobs
        max_jobs: usize,
    },

    /// The job observed a cancellation request
    #[error("Job {0} was cancelled")]
    JobCancelled(JobId),

    /// The worker was asked to abandon its current iteration
    #[error("Current iteration skipped")]
    IterationSkipped,

    /// No such job in the job table
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// The job's slot was already returned to the pool
    #[error("Job {0} was already released")]
    JobAlreadyReleased(JobId),

    /// A job state transition that the state machine forbids
    #[error("Invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        /// Job id
        job: JobId,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// The job cannot produce an on-demand preview
    #[error("Preview unavailable: {0}")]
    PreviewUnavailable(String),

    /// Invalid argument error
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a model load error from any displayable cause
    pub fn model_load(name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::ModelLoad {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the error is a duplicate loader registration
    pub fn is_duplicate_loader(&self) -> bool {
        matches!(self, Error::DuplicateLoader(_))
    }

    /// Returns true if the error is a model load failure
    pub fn is_model_load(&self) -> bool {
        matches!(self, Error::ModelLoad { .. })
    }

    /// Returns true if the error is a capacity failure
    pub fn is_insufficient_capacity(&self) -> bool {
        matches!(self, Error::InsufficientCapacity { .. })
    }

    /// Returns true if the error is an exhausted job pool
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Error::PoolExhausted { .. })
    }

    /// Returns true if the error is a cancellation.
    ///
    /// Cancellation is a recognized early exit, not a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::JobCancelled(_))
    }

    /// Returns true if the error asks the worker to move on to the next iteration
    pub fn is_iteration_skipped(&self) -> bool {
        matches!(self, Error::IterationSkipped)
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::UnknownModel(_) | Error::JobNotFound(_))
    }

    /// Returns true if the error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let job = JobId::new();

        assert!(Error::DuplicateLoader("sd_full".into()).is_duplicate_loader());
        assert!(Error::model_load("sd_full", "missing weights").is_model_load());
        assert!(Error::PoolExhausted { max_jobs: 2 }.is_pool_exhausted());
        assert!(Error::JobCancelled(job).is_cancelled());
        assert!(Error::JobNotFound(job).is_not_found());
        assert!(Error::UnknownModel("x".into()).is_not_found());
        assert!(Error::IterationSkipped.is_iteration_skipped());
        assert!(!Error::Timeout("x".into()).is_cancelled());
    }

    #[test]
    fn test_display() {
        let err = Error::InsufficientCapacity {
            name: "B".into(),
            device: Device::Cuda(0),
            required: 3,
            reclaimable: 1,
            capacity: 4,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient capacity on cuda:0 for model B: requires 3 units, 1 reclaimable of 4"
        );
        assert_eq!(
            Error::model_load("GFPGAN", "file not found").to_string(),
            "Failed to load model GFPGAN: file not found"
        );
    }
}
