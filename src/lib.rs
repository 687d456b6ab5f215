//! Main integration module for the Diffusion Orchestrator
//!
//! This module wires the configuration, the model repository, the job
//! manager and the generation pipeline together and provides the entry
//! points used by the command line.

pub mod pipeline;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use common::models::{Device, JobId, JobState};
use job_manager::{JobManager, JobOptions};
use model_manager::{MemoryUsage, ModelRepository};
use settings::ConfigManager;

use crate::pipeline::{
    register_configured_simulations, GenerationRequest, SimulatedPipeline, FACE_RESTORER,
    SUPER_RESOLUTION, UPSCALER_PRIORITY,
};

/// Availability of the configured models
#[derive(Debug, Clone, Serialize)]
pub struct ModelReport {
    /// Registered models and whether they are loadable
    pub models: Vec<(String, bool)>,
    /// Preferred upscaler, if any is loadable
    pub upscaler: Option<String>,
    /// Face restoration is available
    pub face_restoration: bool,
    /// Latent super-resolution is available
    pub super_resolution: bool,
    /// Per-device budgets
    pub budgets: Vec<(Device, String)>,
}

/// Main diffusion orchestrator
pub struct DiffusionOrchestrator {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    /// Model repository
    repository: Arc<ModelRepository>,

    /// Job manager
    jobs: Arc<JobManager>,

    /// Generation pipeline
    pipeline: Arc<SimulatedPipeline>,
}

impl DiffusionOrchestrator {
    /// Creates an orchestrator from a loaded configuration
    pub fn new(config_manager: ConfigManager) -> Result<Self> {
        info!("Initializing diffusion orchestrator");

        let settings = config_manager.settings();

        let repository = Arc::new(
            ModelRepository::from_settings(&settings.models)
                .context("Failed to build the model repository")?,
        );
        register_configured_simulations(&repository, &settings.models.models)
            .context("Failed to register simulated models")?;

        let pipeline = Arc::new(SimulatedPipeline::new(
            repository.clone(),
            settings.pipeline.optimized,
        ));
        pipeline
            .register_models()
            .context("Failed to register diffusion models")?;

        let jobs = Arc::new(
            JobManager::from_settings(&settings.jobs).context("Failed to create the job manager")?,
        );

        info!(
            "Diffusion orchestrator ready: {} model(s), {} job slot(s)",
            repository.registered().len(),
            jobs.max_jobs()
        );

        Ok(Self {
            config_manager: Arc::new(config_manager),
            repository,
            jobs,
            pipeline,
        })
    }

    /// Reports which models are loadable, picking the preferred upscaler
    pub fn check(&self) -> ModelReport {
        let models = self
            .repository
            .registered()
            .into_iter()
            .map(|name| {
                let loadable = self.repository.is_loadable(&name);
                (name, loadable)
            })
            .collect();

        let mut devices: Vec<Device> = vec![self.repository.default_device()];
        for entry in &self.config_manager.settings().models.budgets {
            if !devices.contains(&entry.device) {
                devices.push(entry.device);
            }
        }

        ModelReport {
            models,
            upscaler: self
                .repository
                .first_loadable(&UPSCALER_PRIORITY)
                .map(str::to_string),
            face_restoration: self.repository.is_loadable(FACE_RESTORER),
            super_resolution: self.repository.is_loadable(SUPER_RESOLUTION),
            budgets: devices
                .into_iter()
                .map(|device| (device, self.repository.budget(&device).to_string()))
                .collect(),
        }
    }

    /// Submits a generation job with the default options and runs it in the background
    pub async fn submit_generation(&self, request: GenerationRequest) -> Result<JobId> {
        self.submit_generation_with(request, self.jobs.default_options().clone())
            .await
    }

    /// Submits a generation job and runs it in the background
    pub async fn submit_generation_with(
        &self,
        request: GenerationRequest,
        options: JobOptions,
    ) -> Result<JobId> {
        let handle = self
            .jobs
            .submit_with(options)
            .await
            .context("Failed to submit generation job")?;
        let id = handle.id();

        let pipeline = self.pipeline.clone();
        self.jobs
            .spawn(handle, move |ctx| async move { pipeline.run(ctx, request).await });

        Ok(id)
    }

    /// Waits for a job to finish
    pub async fn wait(&self, id: &JobId) -> Result<JobState> {
        self.jobs
            .wait(id)
            .await
            .with_context(|| format!("Failed to wait for job {}", id))
    }

    /// Gets the usage of every device that held a model
    pub fn usage(&self) -> Vec<MemoryUsage> {
        self.repository.all_usage()
    }

    /// Cancels unfinished jobs, waits for them and unloads idle models
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down diffusion orchestrator");

        let unfinished: Vec<JobId> = self
            .jobs
            .list()
            .into_iter()
            .filter(|snapshot| !snapshot.state.is_terminal())
            .map(|snapshot| snapshot.id)
            .collect();

        for id in &unfinished {
            if let Err(e) = self.jobs.request_cancel(id) {
                warn!("Could not cancel job {}: {}", id, e);
            }
        }

        // Queued jobs leave the table as soon as their slot wait is cancelled
        for id in &unfinished {
            match self.jobs.wait(id).await {
                Ok(state) => debug!("Job {} finished as {}", id, state),
                Err(e) if e.is_not_found() => debug!("Job {} left before starting", id),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to wait for job {}", id))
                }
            }
        }

        self.repository.shutdown().await;

        info!("Diffusion orchestrator stopped");
        Ok(())
    }

    /// Gets the model repository
    pub fn repository(&self) -> Arc<ModelRepository> {
        self.repository.clone()
    }

    /// Gets the job manager
    pub fn jobs(&self) -> Arc<JobManager> {
        self.jobs.clone()
    }

    /// Gets the generation pipeline
    pub fn pipeline(&self) -> Arc<SimulatedPipeline> {
        self.pipeline.clone()
    }

    /// Gets the configuration manager
    pub fn config_manager(&self) -> Arc<ConfigManager> {
        self.config_manager.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::models::{ModelFamily, Precision};
    use settings::{BudgetSettings, CoreSettings, ModelSpecSettings, SlotPolicyKind};

    fn orchestrator(settings: CoreSettings) -> DiffusionOrchestrator {
        DiffusionOrchestrator::new(ConfigManager::from_settings(settings).unwrap()).unwrap()
    }

    fn request(iterations: u32, steps: u64) -> GenerationRequest {
        GenerationRequest {
            iterations,
            steps,
            width: 8,
            height: 8,
            step_delay: Duration::from_millis(1),
        }
    }

    fn simulated(name: &str, family: ModelFamily) -> ModelSpecSettings {
        ModelSpecSettings {
            name: name.to_string(),
            family,
            weights: None,
            device: Some(Device::Cpu),
            precision: Precision::Half,
            memory_bytes: Some(64 * 1024 * 1024),
        }
    }

    #[tokio::test]
    async fn test_check_picks_upscaler() {
        let mut settings = CoreSettings::default();
        settings.models.models = vec![
            simulated("RealESRGAN_x4plus_anime_6B", ModelFamily::Upscaler),
            simulated(FACE_RESTORER, ModelFamily::FaceRestorer),
        ];

        let report = orchestrator(settings).check();
        assert_eq!(report.upscaler.as_deref(), Some("RealESRGAN_x4plus_anime_6B"));
        assert!(report.face_restoration);
        assert!(!report.super_resolution);
        assert!(report.models.iter().any(|(name, loadable)| name == "sd_full" && *loadable));
        assert_eq!(report.budgets[0].0, Device::Cuda(0));
    }

    #[tokio::test]
    async fn test_concurrent_jobs_share_models() {
        let mut settings = CoreSettings::default();
        settings.jobs.max_concurrent_jobs = 2;
        settings.pipeline.optimized = true;
        settings.models.default_budget = BudgetSettings { bytes: None, models: Some(3) };

        let orchestrator = orchestrator(settings);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(orchestrator.submit_generation(request(2, 6)).await.unwrap());
        }

        for id in &ids {
            assert_eq!(orchestrator.wait(id).await.unwrap(), JobState::Completed);
        }

        let jobs = orchestrator.jobs();
        for id in &ids {
            assert_eq!(jobs.take_result(id).unwrap().outputs.len(), 2);
        }

        let usage = orchestrator.usage();
        assert!(usage.iter().all(|usage| usage.peak <= usage.capacity));
        assert_eq!(jobs.available_slots(), 2);

        orchestrator.shutdown().await.unwrap();
        assert!(orchestrator.repository().resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_models_and_slot() {
        let mut settings = CoreSettings::default();
        settings.jobs.slot_policy = SlotPolicyKind::Reject;

        let orchestrator = orchestrator(settings);
        let id = orchestrator
            .submit_generation(GenerationRequest {
                iterations: 100,
                steps: 100,
                ..request(1, 1)
            })
            .await
            .unwrap();

        let jobs = orchestrator.jobs();
        while jobs.snapshot(&id).unwrap().active_iteration == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(jobs.submit().await.unwrap_err().is_pool_exhausted());

        let preview = jobs.request_preview(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(preview.dimensions(), (8, 8));

        jobs.request_cancel(&id).unwrap();
        assert_eq!(orchestrator.wait(&id).await.unwrap(), JobState::Cancelled);
        assert_eq!(jobs.available_slots(), 1);
        assert_eq!(orchestrator.repository().ref_count("sd_full"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_job_waiting_for_slot() {
        let mut settings = CoreSettings::default();
        settings.jobs.max_concurrent_jobs = 1;
        settings.jobs.slot_policy = SlotPolicyKind::Block;

        let orchestrator = Arc::new(orchestrator(settings));
        let running = orchestrator
            .submit_generation(request(100, 100))
            .await
            .unwrap();

        let jobs = orchestrator.jobs();
        while jobs.snapshot(&running).unwrap().active_iteration == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let waiting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.submit_generation(request(1, 1)).await })
        };
        while jobs.list().len() < 2 {
            tokio::task::yield_now().await;
        }
        assert!(jobs
            .list()
            .iter()
            .any(|snapshot| snapshot.state == JobState::Queued));

        orchestrator.shutdown().await.unwrap();

        assert!(waiting.await.unwrap().is_err());
        assert_eq!(jobs.snapshot(&running).unwrap().state, JobState::Cancelled);
        assert_eq!(jobs.list().len(), 1);
        assert_eq!(jobs.available_slots(), 1);
        assert!(orchestrator.repository().resident_models().is_empty());
    }

    #[tokio::test]
    async fn test_configured_weights_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("GFPGANv1.3.pth");
        std::fs::write(&weights, vec![0u8; 4096]).unwrap();

        let config_path = dir.path().join("diffusion.toml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        write!(
            file,
            r#"
[jobs]
max_concurrent_jobs = 1

[[models.budgets]]
device = "cpu"
bytes = 10000

[[models.models]]
name = "GFPGAN"
family = "face_restorer"
weights = "{}"
device = "cpu"
precision = "full"

[[models.models]]
name = "LDSR"
family = "super_resolution"
weights = "{}"
"#,
            weights.display(),
            dir.path().join("missing.ckpt").display()
        )
        .unwrap();

        let orchestrator =
            DiffusionOrchestrator::new(ConfigManager::from_file(&config_path).unwrap()).unwrap();
        let report = orchestrator.check();
        assert!(report.face_restoration);
        assert!(!report.super_resolution);
        assert!(report.budgets.iter().any(|(device, _)| *device == Device::Cpu));

        let repository = orchestrator.repository();
        let handle = repository.acquire(FACE_RESTORER).await.unwrap();
        assert_eq!(handle.device(), Device::Cpu);
        // 4096 bytes in full precision plus 20% overhead
        assert_eq!(repository.usage(&Device::Cpu).used, 4915);
    }
}
