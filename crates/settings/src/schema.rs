//! Typed configuration schema
//!
//! Every section has serde defaults so a missing file, or a file that only
//! overrides a handful of keys, still yields a complete [`CoreSettings`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use common::models::{Device, ModelFamily, Precision};

/// Root of the configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    /// Job manager settings
    pub jobs: JobSettings,
    /// Model repository settings
    pub models: ModelSettings,
    /// Logging settings
    pub logging: LoggingSettings,
    /// Generation pipeline settings
    pub pipeline: PipelineSettings,
}

/// What `submit` does when every job slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SlotPolicyKind {
    /// Wait for a slot, optionally bounded by `slot_timeout_ms`
    #[default]
    Block,
    /// Fail immediately
    Reject,
}

/// Job manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Maximum number of concurrently running jobs
    pub max_concurrent_jobs: usize,
    /// Slot acquisition policy
    pub slot_policy: SlotPolicyKind,
    /// Upper bound on a blocking slot wait, in milliseconds
    pub slot_timeout_ms: Option<u64>,
    /// Sampling iterations between recorded previews
    pub preview_interval: u64,
    /// Record periodic previews by default
    pub record_steps: bool,
    /// Bound of the recorded preview buffer
    pub max_recorded_previews: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 1,
            slot_policy: SlotPolicyKind::Block,
            slot_timeout_ms: None,
            preview_interval: 10,
            record_steps: false,
            max_recorded_previews: 32,
        }
    }
}

/// Memory budget of one device.
///
/// At most one of `bytes` and `models` may be set; neither means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Budget in bytes
    pub bytes: Option<u64>,
    /// Budget as a number of resident models
    pub models: Option<usize>,
}

/// Budget override for a specific device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBudgetSettings {
    /// Device the budget applies to
    pub device: Device,
    /// Budget in bytes
    #[serde(default)]
    pub bytes: Option<u64>,
    /// Budget as a number of resident models
    #[serde(default)]
    pub models: Option<usize>,
}

impl DeviceBudgetSettings {
    /// Gets the budget part of the entry
    pub fn budget(&self) -> BudgetSettings {
        BudgetSettings {
            bytes: self.bytes,
            models: self.models,
        }
    }
}

/// One model loader declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpecSettings {
    /// Unique loader name
    pub name: String,
    /// Model family
    pub family: ModelFamily,
    /// Path to the weights file
    #[serde(default)]
    pub weights: Option<PathBuf>,
    /// Target device, defaults to the repository default device
    #[serde(default)]
    pub device: Option<Device>,
    /// Load precision
    #[serde(default)]
    pub precision: Precision,
    /// Explicit memory cost in bytes; estimated from the weights file when absent
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Model repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Device used by loaders that do not name one
    pub default_device: Device,
    /// Budget applied to devices without an explicit entry
    pub default_budget: BudgetSettings,
    /// Per-device budgets
    pub budgets: Vec<DeviceBudgetSettings>,
    /// Declared model loaders
    pub models: Vec<ModelSpecSettings>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            default_device: Device::Cuda(0),
            default_budget: BudgetSettings::default(),
            budgets: Vec::new(),
            models: Vec::new(),
        }
    }
}

impl ModelSettings {
    /// Gets the budget configured for a device
    pub fn budget_for(&self, device: &Device) -> BudgetSettings {
        self.budgets
            .iter()
            .find(|entry| &entry.device == device)
            .map(DeviceBudgetSettings::budget)
            .unwrap_or_else(|| self.default_budget.clone())
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default level when RUST_LOG is not set
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Also write logs to a daily rolling file at this path
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "error".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Generation pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Load the diffusion model as three separate stages instead of one
    pub optimized: bool,
}
