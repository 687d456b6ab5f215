//! Device memory budgets
//!
//! A budget is either a byte capacity or a model-count heuristic. Under the
//! model-count heuristic every resident model costs exactly one unit, whatever
//! its loader reports.

use std::fmt;

use serde::Serialize;

use common::error::{Error, Result};
use common::models::Device;
use settings::BudgetSettings;

/// Capacity of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryBudget {
    /// No limit; nothing is ever evicted for room
    #[default]
    Unlimited,
    /// Capacity in bytes
    Bytes(u64),
    /// Capacity in resident models
    Models(usize),
}

impl MemoryBudget {
    /// Builds a budget from its configuration entry
    pub fn from_settings(settings: &BudgetSettings) -> Result<Self> {
        match (settings.bytes, settings.models) {
            (Some(_), Some(_)) => Err(Error::Config(
                "A budget sets either bytes or models, not both".to_string(),
            )),
            (Some(bytes), None) => Ok(MemoryBudget::Bytes(bytes)),
            (None, Some(models)) => Ok(MemoryBudget::Models(models)),
            (None, None) => Ok(MemoryBudget::Unlimited),
        }
    }

    /// Total capacity in budget units
    pub fn capacity(&self) -> u64 {
        match self {
            MemoryBudget::Unlimited => u64::MAX,
            MemoryBudget::Bytes(bytes) => *bytes,
            MemoryBudget::Models(count) => *count as u64,
        }
    }

    /// Cost of a model in budget units
    pub fn cost_of(&self, memory_cost: u64) -> u64 {
        match self {
            MemoryBudget::Models(_) => 1,
            _ => memory_cost,
        }
    }
}

impl fmt::Display for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryBudget::Unlimited => write!(f, "unlimited"),
            MemoryBudget::Bytes(bytes) => write!(f, "{}", common::utils::format_bytes(*bytes)),
            MemoryBudget::Models(count) => write!(f, "{} model(s)", count),
        }
    }
}

/// Resident usage of one device, in budget units
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Device
    pub device: Device,
    /// Units currently held by resident models
    pub used: u64,
    /// Total capacity
    pub capacity: u64,
    /// Highest `used` ever observed
    pub peak: u64,
    /// Number of resident models
    pub resident_count: usize,
}

impl MemoryUsage {
    /// Units still free
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let bytes = BudgetSettings { bytes: Some(4096), models: None };
        let models = BudgetSettings { bytes: None, models: Some(2) };
        let both = BudgetSettings { bytes: Some(1), models: Some(1) };

        assert_eq!(MemoryBudget::from_settings(&bytes).unwrap(), MemoryBudget::Bytes(4096));
        assert_eq!(MemoryBudget::from_settings(&models).unwrap(), MemoryBudget::Models(2));
        assert_eq!(
            MemoryBudget::from_settings(&BudgetSettings::default()).unwrap(),
            MemoryBudget::Unlimited
        );
        assert!(MemoryBudget::from_settings(&both).is_err());
    }

    #[test]
    fn test_model_count_heuristic() {
        let budget = MemoryBudget::Models(2);
        assert_eq!(budget.capacity(), 2);
        assert_eq!(budget.cost_of(4_000_000_000), 1);

        let budget = MemoryBudget::Bytes(10);
        assert_eq!(budget.cost_of(3), 3);
    }
}
