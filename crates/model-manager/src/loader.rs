//! Model loader abstraction
//!
//! A loader knows how to materialize one model family on a device and how
//! much device memory the result occupies. The repository decides *when* to
//! call it.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::{Device, ModelFamily, Precision};
use settings::ModelSpecSettings;

/// A materialized model, type-erased so one repository can hold every family
pub type LoadedModel = Arc<dyn Any + Send + Sync>;

/// Loads and unloads one kind of model
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Family of the model this loader produces
    fn family(&self) -> ModelFamily;

    /// Device memory the loaded model occupies, in bytes
    fn memory_cost(&self) -> u64;

    /// Target device; `None` uses the repository default
    fn device(&self) -> Option<Device> {
        None
    }

    /// Precision the model is loaded with
    fn precision(&self) -> Precision {
        Precision::Half
    }

    /// Whether the backing resource (weights on disk) is present.
    ///
    /// Must not load the model.
    fn is_available(&self) -> bool {
        true
    }

    /// Materializes the model on `device`
    async fn load(&self, device: &Device) -> Result<LoadedModel>;

    /// Releases a model previously returned by `load`
    async fn unload(&self, model: LoadedModel) -> Result<()> {
        drop(model);
        Ok(())
    }
}

/// Immutable snapshot of a loader's attributes taken at registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderSpec {
    /// Unique name
    pub name: String,
    /// Model family
    pub family: ModelFamily,
    /// Resolved target device
    pub device: Device,
    /// Memory cost in bytes
    pub memory_cost: u64,
    /// Load precision
    pub precision: Precision,
}

impl LoaderSpec {
    /// Captures the attributes of `loader`, resolving its device against `default_device`
    pub fn capture(name: &str, loader: &dyn ModelLoader, default_device: Device) -> Self {
        Self {
            name: name.to_string(),
            family: loader.family(),
            device: loader.device().unwrap_or(default_device),
            memory_cost: loader.memory_cost(),
            precision: loader.precision(),
        }
    }
}

/// Estimates the device footprint of a checkpoint.
///
/// Checkpoints are assumed to be stored in full precision; loading in half
/// precision halves the weights. A 20% overhead is added for activations and
/// allocator slack.
pub fn estimate_memory_cost(weights_bytes: u64, precision: Precision) -> u64 {
    let weights = weights_bytes / Precision::Full.bytes_per_element() * precision.bytes_per_element();
    weights + weights / 5
}

/// Builds a model from a weights file on a device
pub type WeightsConstructor =
    Arc<dyn Fn(&Path, &Device, Precision) -> Result<LoadedModel> + Send + Sync>;

/// Raw checkpoint bytes, the default product of a [`WeightsFileLoader`]
#[derive(Debug)]
pub struct RawWeights {
    /// File the weights were read from
    pub path: PathBuf,
    /// Device the weights are bound to
    pub device: Device,
    /// Load precision
    pub precision: Precision,
    /// File contents
    pub bytes: Vec<u8>,
}

/// Loader backed by a weights file on disk
pub struct WeightsFileLoader {
    family: ModelFamily,
    weights: PathBuf,
    device: Option<Device>,
    precision: Precision,
    memory_cost: u64,
    constructor: WeightsConstructor,
}

impl WeightsFileLoader {
    /// Creates a loader that reads the raw weights into memory
    pub fn new(
        family: ModelFamily,
        weights: impl Into<PathBuf>,
        device: Option<Device>,
        precision: Precision,
    ) -> Self {
        let weights = weights.into();
        let memory_cost = std::fs::metadata(&weights)
            .map(|meta| estimate_memory_cost(meta.len(), precision))
            .unwrap_or(0);

        Self {
            family,
            weights,
            device,
            precision,
            memory_cost,
            constructor: Arc::new(read_raw_weights),
        }
    }

    /// Creates a loader from a configuration entry
    pub fn from_settings(spec: &ModelSpecSettings) -> Result<Self> {
        let weights = spec.weights.clone().ok_or_else(|| {
            Error::Config(format!("Model {} has no weights path", spec.name))
        })?;

        let mut loader = Self::new(spec.family, weights, spec.device, spec.precision);
        if let Some(bytes) = spec.memory_bytes {
            loader.memory_cost = bytes;
        }

        Ok(loader)
    }

    /// Overrides the estimated memory cost
    pub fn with_memory_cost(mut self, memory_cost: u64) -> Self {
        self.memory_cost = memory_cost;
        self
    }

    /// Replaces the default raw-bytes constructor
    pub fn with_constructor(mut self, constructor: WeightsConstructor) -> Self {
        self.constructor = constructor;
        self
    }

    /// Gets the weights path
    pub fn weights(&self) -> &Path {
        &self.weights
    }
}

fn read_raw_weights(path: &Path, device: &Device, precision: Precision) -> Result<LoadedModel> {
    let bytes = std::fs::read(path)?;
    Ok(Arc::new(RawWeights {
        path: path.to_path_buf(),
        device: *device,
        precision,
        bytes,
    }))
}

#[async_trait]
impl ModelLoader for WeightsFileLoader {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn memory_cost(&self) -> u64 {
        self.memory_cost
    }

    fn device(&self) -> Option<Device> {
        self.device
    }

    fn precision(&self) -> Precision {
        self.precision
    }

    fn is_available(&self) -> bool {
        self.weights.is_file()
    }

    async fn load(&self, device: &Device) -> Result<LoadedModel> {
        if !self.is_available() {
            return Err(Error::model_load(
                self.weights.display().to_string(),
                "weights file not found",
            ));
        }

        info!("Reading {} weights from {}", self.family, self.weights.display());

        let constructor = self.constructor.clone();
        let path = self.weights.clone();
        let device = *device;
        let precision = self.precision;

        // Checkpoint parsing is blocking I/O
        let model = tokio::task::spawn_blocking(move || constructor(&path, &device, precision))
            .await
            .map_err(|e| Error::Internal(format!("Weights loader task failed: {}", e)))??;

        debug!("Weights {} bound to {}", self.weights.display(), device);

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_estimate_memory_cost() {
        assert_eq!(estimate_memory_cost(1000, Precision::Full), 1200);
        assert_eq!(estimate_memory_cost(1000, Precision::Half), 600);
        assert_eq!(estimate_memory_cost(0, Precision::Half), 0);
    }

    #[tokio::test]
    async fn test_weights_file_loader() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[7u8; 2000]).unwrap();

        let loader = WeightsFileLoader::new(
            ModelFamily::FaceRestorer,
            file.path(),
            Some(Device::Cpu),
            Precision::Full,
        );

        assert!(loader.is_available());
        assert_eq!(loader.memory_cost(), 2400);
        assert_eq!(loader.device(), Some(Device::Cpu));

        let model = loader.load(&Device::Cpu).await.unwrap();
        let weights = model.downcast_ref::<RawWeights>().unwrap();
        assert_eq!(weights.bytes.len(), 2000);
        assert_eq!(weights.device, Device::Cpu);
    }

    #[tokio::test]
    async fn test_missing_weights() {
        let loader = WeightsFileLoader::new(
            ModelFamily::SuperResolution,
            "/nonexistent/model.ckpt",
            None,
            Precision::Half,
        );

        assert!(!loader.is_available());
        assert_eq!(loader.memory_cost(), 0);
        let err = loader.load(&Device::Cuda(0)).await.err().unwrap();
        assert!(err.is_model_load());
    }

    #[test]
    fn test_from_settings_prefers_explicit_cost() {
        let spec = ModelSpecSettings {
            name: "LDSR".to_string(),
            family: ModelFamily::SuperResolution,
            weights: Some(PathBuf::from("/nonexistent/ldsr.ckpt")),
            device: None,
            precision: Precision::Half,
            memory_bytes: Some(5_000),
        };

        let loader = WeightsFileLoader::from_settings(&spec).unwrap();
        assert_eq!(loader.memory_cost(), 5_000);
        assert_eq!(loader.weights(), Path::new("/nonexistent/ldsr.ckpt"));
    }

    #[test]
    fn test_spec_capture_resolves_default_device() {
        let loader = WeightsFileLoader::new(
            ModelFamily::Upscaler,
            "/nonexistent/esrgan.pth",
            None,
            Precision::Half,
        )
        .with_memory_cost(42);

        let spec = LoaderSpec::capture("RealESRGAN_x4plus", &loader, Device::Cuda(1));
        assert_eq!(spec.device, Device::Cuda(1));
        assert_eq!(spec.memory_cost, 42);
        assert_eq!(spec.family, ModelFamily::Upscaler);
    }
}
