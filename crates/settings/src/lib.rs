//! Configuration management for Diffusion Orchestrator
//!
//! This crate provides functionality for loading and validating the settings
//! consumed at startup: job concurrency, per-device memory budgets, preview
//! checkpoint interval, declared model loaders and logging.

pub mod manager;
pub mod schema;
pub mod validation;

// Re-export commonly used types
pub use manager::{ConfigManager, ENV_PREFIX};
pub use schema::{
    BudgetSettings, CoreSettings, DeviceBudgetSettings, JobSettings, LoggingSettings,
    ModelSettings, ModelSpecSettings, PipelineSettings, SlotPolicyKind,
};
pub use validation::ConfigValidator;
