//! Configuration validation

use std::collections::HashSet;

use common::error::{Error, Result};

use crate::schema::{BudgetSettings, CoreSettings};

/// Validates a loaded configuration tree
pub struct ConfigValidator;

impl ConfigValidator {
    /// Checks every section and reports the first violation as `Error::Config`
    pub fn validate(settings: &CoreSettings) -> Result<()> {
        let jobs = &settings.jobs;

        if jobs.max_concurrent_jobs == 0 {
            return Err(Error::Config("jobs.max_concurrent_jobs must be at least 1".to_string()));
        }

        if jobs.preview_interval == 0 {
            return Err(Error::Config("jobs.preview_interval must be at least 1".to_string()));
        }

        if jobs.max_recorded_previews == 0 {
            return Err(Error::Config("jobs.max_recorded_previews must be at least 1".to_string()));
        }

        Self::validate_budget("models.default_budget", &settings.models.default_budget)?;

        let mut devices = HashSet::new();
        for entry in &settings.models.budgets {
            if !devices.insert(entry.device) {
                return Err(Error::Config(format!(
                    "Duplicate budget for device {}",
                    entry.device
                )));
            }
            Self::validate_budget(&format!("models.budgets[{}]", entry.device), &entry.budget())?;
        }

        let mut names = HashSet::new();
        for spec in &settings.models.models {
            if spec.name.trim().is_empty() {
                return Err(Error::Config("Model name must not be empty".to_string()));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(Error::Config(format!("Duplicate model name: {}", spec.name)));
            }
            if spec.weights.is_none() && spec.memory_bytes.is_none() {
                return Err(Error::Config(format!(
                    "Model {} needs either a weights path or memory_bytes",
                    spec.name
                )));
            }
        }

        Ok(())
    }

    fn validate_budget(key: &str, budget: &BudgetSettings) -> Result<()> {
        match (budget.bytes, budget.models) {
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "{}: set either bytes or models, not both",
                key
            ))),
            (_, Some(0)) => Err(Error::Config(format!("{}: models must be at least 1", key))),
            _ => Ok(()),
        }
    }
}
