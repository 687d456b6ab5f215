//! Common utilities and types for Diffusion Orchestrator
//!
//! This crate provides shared functionality used across the Diffusion Orchestrator
//! system, including the error taxonomy, device and job data models, and utility
//! functions.

pub mod error;
pub mod models;
pub mod utils;

// Re-export commonly used types
pub use error::{Error, Result};
pub use models::*;
