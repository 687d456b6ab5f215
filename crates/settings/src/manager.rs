//! Configuration manager implementation
//!
//! Layers built-in defaults, an optional TOML/YAML/JSON file and
//! `DIFFUSION__*` environment variables, then exposes both the typed
//! [`CoreSettings`] tree and key-based getters over the merged result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use common::error::{Error, Result};

use crate::schema::CoreSettings;
use crate::validation::ConfigValidator;

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "DIFFUSION";

/// Configuration manager
pub struct ConfigManager {
    /// Typed settings
    settings: CoreSettings,

    /// Effective configuration, defaults included
    effective: Config,

    /// File the configuration was read from, if any
    source_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a configuration manager from defaults and the environment
    pub fn new() -> Result<Self> {
        Self::load(None)
    }

    /// Creates a configuration manager from a file, the defaults and the environment
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Creates a configuration manager from already-built settings
    pub fn from_settings(settings: CoreSettings) -> Result<Self> {
        ConfigValidator::validate(&settings)?;
        let effective = Config::try_from(&settings).map_err(config_error)?;

        Ok(Self {
            settings,
            effective,
            source_path: None,
        })
    }

    fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::Config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            info!("Loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let layered = builder.build().map_err(config_error)?;
        let settings: CoreSettings = layered.try_deserialize().map_err(config_error)?;

        ConfigValidator::validate(&settings)?;

        debug!(
            "Configuration loaded: {} model(s), max {} concurrent job(s)",
            settings.models.models.len(),
            settings.jobs.max_concurrent_jobs
        );

        let effective = Config::try_from(&settings).map_err(config_error)?;

        Ok(Self {
            settings,
            effective,
            source_path: path.map(Path::to_path_buf),
        })
    }

    /// Gets the typed settings
    pub fn settings(&self) -> &CoreSettings {
        &self.settings
    }

    /// Gets the file the configuration was read from
    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    /// Gets a value of any deserializable type
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.effective.get::<T>(key).map_err(config_error)
    }

    /// Gets a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        self.get(key)
    }

    /// Gets an unsigned integer value
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        self.get(key)
    }

    /// Gets a 64-bit unsigned integer value
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        self.get(key)
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.get(key)
    }

    /// Gets a duration stored in milliseconds
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }

    /// Gets a filesystem path
    pub fn get_path(&self, key: &str) -> Result<PathBuf> {
        self.get_string(key).map(PathBuf::from)
    }
}

fn config_error(err: config::ConfigError) -> Error {
    Error::Config(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{Device, ModelFamily, Precision};
    use std::io::Write;

    use crate::schema::SlotPolicyKind;

    fn write_config(extension: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(extension)
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let manager = ConfigManager::from_settings(CoreSettings::default()).unwrap();
        let settings = manager.settings();

        assert_eq!(settings.jobs.max_concurrent_jobs, 1);
        assert_eq!(settings.jobs.slot_policy, SlotPolicyKind::Block);
        assert_eq!(settings.models.default_device, Device::Cuda(0));
        assert_eq!(manager.get_usize("jobs.max_concurrent_jobs").unwrap(), 1);
        assert_eq!(manager.get_string("logging.level").unwrap(), "error");
        assert!(!manager.get_bool("pipeline.optimized").unwrap());
    }

    #[test]
    fn test_toml_file() {
        let file = write_config(
            ".toml",
            r#"
[jobs]
max_concurrent_jobs = 2
slot_policy = "reject"
slot_timeout_ms = 250
preview_interval = 5

[models]
default_device = "cuda:1"

[[models.budgets]]
device = "cuda:1"
bytes = 8000000000

[[models.models]]
name = "RealESRGAN_x4plus"
family = "upscaler"
device = "cpu"
precision = "full"
memory_bytes = 67000000
"#,
        );

        let manager = ConfigManager::from_file(file.path()).unwrap();
        let settings = manager.settings();

        assert_eq!(settings.jobs.max_concurrent_jobs, 2);
        assert_eq!(settings.jobs.slot_policy, SlotPolicyKind::Reject);
        assert_eq!(settings.jobs.preview_interval, 5);
        assert_eq!(settings.jobs.max_recorded_previews, 32);
        assert_eq!(settings.models.default_device, Device::Cuda(1));
        assert_eq!(
            settings.models.budget_for(&Device::Cuda(1)).bytes,
            Some(8_000_000_000)
        );
        assert_eq!(settings.models.budget_for(&Device::Cpu).bytes, None);

        let spec = &settings.models.models[0];
        assert_eq!(spec.family, ModelFamily::Upscaler);
        assert_eq!(spec.device, Some(Device::Cpu));
        assert_eq!(spec.precision, Precision::Full);
        assert_eq!(settings.jobs.slot_timeout_ms, Some(250));
        assert_eq!(
            manager.get_duration("jobs.slot_timeout_ms").unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(manager.source_path(), Some(file.path()));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let file = write_config(".toml", "[jobs]\nmax_concurrent_jobs = 0\n");
        let err = ConfigManager::from_file(file.path()).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigManager::from_file("/nonexistent/diffusion.toml").err().unwrap();
        assert!(err.to_string().contains("not found"));
    }
}
