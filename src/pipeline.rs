//! Simulated txt2img pipeline
//!
//! Stands in for the diffusion sampler: it acquires the same models in the
//! same order a real sampling loop does, reports progress through the job
//! context and produces placeholder images, so the repository and the job
//! manager can be exercised end to end without a GPU.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::{Device, Image, ModelFamily, Precision};
use job_manager::JobContext;
use model_manager::{LoadedModel, ModelLoader, ModelRepository};
use settings::ModelSpecSettings;

/// Single checkpoint holding U-Net, conditioner and decoder
pub const SD_FULL: &str = "sd_full";
/// Split U-Net stage
pub const SD_UNET: &str = "sd_unet";
/// Split conditioning stage
pub const SD_CONDITIONER: &str = "sd_cs";
/// Split first-stage decoder
pub const SD_DECODER: &str = "sd_fs";

/// Upscalers in order of preference
pub const UPSCALER_PRIORITY: [&str; 2] = ["RealESRGAN_x4plus", "RealESRGAN_x4plus_anime_6B"];

/// Face restoration model
pub const FACE_RESTORER: &str = "GFPGAN";

/// Latent super-resolution model
pub const SUPER_RESOLUTION: &str = "LDSR";

const GIB: u64 = 1024 * 1024 * 1024;

/// Model names the sampling loop acquires for each role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRoles {
    /// Denoiser, held for the whole job
    pub unet: String,
    /// Prompt conditioning, acquired once per batch iteration
    pub conditioner: String,
    /// Latent decoder, acquired for previews and final images
    pub decoder: String,
}

impl ModelRoles {
    /// Maps the roles to one full model, or to three split stages when optimized
    pub fn new(optimized: bool) -> Self {
        let (unet, conditioner, decoder) = if optimized {
            (SD_UNET, SD_CONDITIONER, SD_DECODER)
        } else {
            (SD_FULL, SD_FULL, SD_FULL)
        };

        Self {
            unet: unet.to_string(),
            conditioner: conditioner.to_string(),
            decoder: decoder.to_string(),
        }
    }

    /// Gets the distinct model names with their family and simulated footprint
    pub fn models(&self) -> Vec<(String, ModelFamily, u64)> {
        if self.unet == self.conditioner && self.unet == self.decoder {
            return vec![(self.unet.clone(), ModelFamily::Diffusion, 4 * GIB)];
        }

        vec![
            (self.unet.clone(), ModelFamily::DiffusionUnet, 3 * GIB + GIB / 2),
            (self.conditioner.clone(), ModelFamily::DiffusionConditioner, GIB / 2),
            (self.decoder.clone(), ModelFamily::DiffusionDecoder, GIB / 4),
        ]
    }
}

/// Placeholder for a materialized network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedModel {
    /// Model family
    pub family: ModelFamily,
    /// Device the model was loaded on
    pub device: Device,
    /// Load precision
    pub precision: Precision,
}

/// Loader producing [`SimulatedModel`]s after an optional delay
#[derive(Debug, Clone)]
pub struct SimulatedLoader {
    family: ModelFamily,
    memory_cost: u64,
    device: Option<Device>,
    precision: Precision,
    load_delay: Duration,
}

impl SimulatedLoader {
    /// Creates a loader for the repository default device
    pub fn new(family: ModelFamily, memory_cost: u64) -> Self {
        Self {
            family,
            memory_cost,
            device: None,
            precision: Precision::Half,
            load_delay: Duration::ZERO,
        }
    }

    /// Creates a loader from a configuration entry without weights
    pub fn from_settings(spec: &ModelSpecSettings) -> Self {
        Self {
            family: spec.family,
            memory_cost: spec.memory_bytes.unwrap_or(0),
            device: spec.device,
            precision: spec.precision,
            load_delay: Duration::ZERO,
        }
    }

    /// Pins the loader to a device
    pub fn on_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Simulates load latency
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }
}

#[async_trait]
impl ModelLoader for SimulatedLoader {
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

    async fn load(&self, device: &Device) -> Result<LoadedModel> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        Ok(Arc::new(SimulatedModel {
            family: self.family,
            device: *device,
            precision: self.precision,
        }))
    }
}

/// Parameters of one simulated generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Batch iterations
    pub iterations: u32,
    /// Sampling steps per iteration
    pub steps: u64,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Simulated duration of one sampling step
    pub step_delay: Duration,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            iterations: 1,
            steps: 50,
            width: 64,
            height: 64,
            step_delay: Duration::from_millis(1),
        }
    }
}

/// Sampling loop over repository-managed models
pub struct SimulatedPipeline {
    repository: Arc<ModelRepository>,
    roles: ModelRoles,
}

impl SimulatedPipeline {
    /// Creates a pipeline over `repository`
    pub fn new(repository: Arc<ModelRepository>, optimized: bool) -> Self {
        Self {
            repository,
            roles: ModelRoles::new(optimized),
        }
    }

    /// Gets the model roles
    pub fn roles(&self) -> &ModelRoles {
        &self.roles
    }

    /// Registers a simulated loader for every role model not registered yet
    pub fn register_models(&self) -> Result<()> {
        for (name, family, cost) in self.roles.models() {
            if self.repository.spec(&name).is_none() {
                self.repository
                    .register(name, Arc::new(SimulatedLoader::new(family, cost)))?;
            }
        }
        Ok(())
    }

    /// Runs one generation job.
    ///
    /// The U-Net is held for the whole job; conditioner and decoder are
    /// acquired around their use, so with split stages they compete for the
    /// remaining device budget.
    pub async fn run(&self, ctx: JobContext, request: GenerationRequest) -> Result<()> {
        let unet = self.repository.acquire(&self.roles.unet).await?;
        debug!("Job {} sampling with {} on {}", ctx.id(), unet.name(), unet.device());

        for n in 0..request.iterations {
            if ctx.is_cancelled() {
                info!("Early exit requested for job {}", ctx.id());
                return Err(Error::JobCancelled(ctx.id()));
            }

            ctx.begin_iteration();
            ctx.set_status(format!("Processing Iteration {}/{}", n + 1, request.iterations));

            {
                let _conditioner = self.repository.acquire(&self.roles.conditioner).await?;
                tokio::task::yield_now().await;
            }

            if !self.sample(&ctx, &request).await? {
                info!("Skipping iteration {} of job {}", n + 1, ctx.id());
                ctx.set_status("Skipping iteration");
                continue;
            }

            let image = self.decode(&request, request.steps, n).await?;
            ctx.push_output(image);
        }

        Ok(())
    }

    /// Runs the sampling steps; returns false if the iteration was skipped
    async fn sample(&self, ctx: &JobContext, request: &GenerationRequest) -> Result<bool> {
        for step in 0..request.steps {
            if !request.step_delay.is_zero() {
                tokio::time::sleep(request.step_delay).await;
            }

            match ctx
                .checkpoint(step, || self.decode(request, step, u32::MAX))
                .await
            {
                Ok(()) => {}
                Err(Error::IterationSkipped) => return Ok(false),
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }

    /// Decodes a placeholder image whose brightness follows sampling progress
    async fn decode(&self, request: &GenerationRequest, step: u64, iteration: u32) -> Result<Image> {
        let decoder = self.repository.acquire(&self.roles.decoder).await?;
        debug!("Decoding step {} with {}", step, decoder.name());

        let progress = if request.steps == 0 {
            255
        } else {
            (step.min(request.steps) * 255 / request.steps) as u8
        };
        let tint = (iteration % 8) as u8 * 32;

        Ok(Arc::new(RgbImage::from_fn(request.width, request.height, |x, y| {
            Rgb([
                progress,
                (x * 255 / request.width.max(1)) as u8,
                tint.wrapping_add((y * 255 / request.height.max(1)) as u8),
            ])
        })))
    }
}

/// Registers simulated loaders for configured models that declare no weights file
pub fn register_configured_simulations(
    repository: &ModelRepository,
    specs: &[ModelSpecSettings],
) -> Result<()> {
    for spec in specs.iter().filter(|spec| spec.weights.is_none()) {
        repository.register(spec.name.clone(), Arc::new(SimulatedLoader::from_settings(spec)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::JobState;
    use job_manager::{JobManager, JobOptions, SlotPolicy};
    use model_manager::MemoryBudget;

    fn request(iterations: u32, steps: u64) -> GenerationRequest {
        GenerationRequest {
            iterations,
            steps,
            width: 8,
            height: 8,
            step_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_roles() {
        let full = ModelRoles::new(false);
        assert_eq!(full.unet, SD_FULL);
        assert_eq!(full.decoder, SD_FULL);
        assert_eq!(full.models().len(), 1);

        let split = ModelRoles::new(true);
        assert_eq!(split.conditioner, SD_CONDITIONER);
        assert_eq!(split.models().len(), 3);
    }

    #[tokio::test]
    async fn test_split_stages_share_budget() {
        let repository = Arc::new(
            ModelRepository::new(Device::Cuda(0)).with_default_budget(MemoryBudget::Models(2)),
        );
        let pipeline = SimulatedPipeline::new(repository.clone(), true);
        pipeline.register_models().unwrap();

        let jobs = JobManager::new(1, SlotPolicy::Reject, JobOptions::default().recording(2)).unwrap();
        let handle = jobs.submit().await.unwrap();
        let id = handle.id();

        let state = handle
            .run(|ctx| async move { pipeline.run(ctx, request(2, 4)).await })
            .await;
        assert_eq!(state, JobState::Completed);

        let result = jobs.take_result(&id).unwrap();
        assert_eq!(result.outputs.len(), 2);
        assert_eq!(result.status, "Processing Iteration 2/2");

        let usage = repository.usage(&Device::Cuda(0));
        assert!(usage.peak <= 2);
        assert!(repository.resident_models().iter().all(|info| info.ref_count == 0));
    }

    #[tokio::test]
    async fn test_skipped_iteration_produces_no_output() {
        let repository = Arc::new(ModelRepository::new(Device::Cuda(0)));
        let pipeline = SimulatedPipeline::new(repository, false);
        pipeline.register_models().unwrap();

        let jobs = JobManager::new(1, SlotPolicy::Reject, JobOptions::default()).unwrap();
        let handle = jobs.submit().await.unwrap();
        let id = handle.id();
        jobs.request_skip(&id).unwrap();

        let state = handle
            .run(|ctx| async move { pipeline.run(ctx, request(3, 5)).await })
            .await;
        assert_eq!(state, JobState::Completed);
        assert_eq!(jobs.take_result(&id).unwrap().outputs.len(), 2);
    }

    #[tokio::test]
    async fn test_configured_simulations() {
        let repository = ModelRepository::new(Device::Cuda(0));
        let specs = vec![ModelSpecSettings {
            name: FACE_RESTORER.to_string(),
            family: ModelFamily::FaceRestorer,
            weights: None,
            device: Some(Device::Cpu),
            precision: Precision::Full,
            memory_bytes: Some(GIB),
        }];

        register_configured_simulations(&repository, &specs).unwrap();
        assert!(repository.is_loadable(FACE_RESTORER));

        let handle = repository.acquire(FACE_RESTORER).await.unwrap();
        let model = handle.downcast_ref::<SimulatedModel>().unwrap();
        assert_eq!(model.device, Device::Cpu);
        assert_eq!(model.family, ModelFamily::FaceRestorer);
    }
}
