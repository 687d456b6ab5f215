//! Common data models for Diffusion Orchestrator
//!
//! This module defines the data models shared by the model repository and the
//! job manager: devices, precision modes, model families, job identifiers and
//! job states.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Image exchanged between a generation worker and its observers
pub type Image = Arc<image::RgbImage>;

/// Device a model is materialized on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    /// Host memory
    Cpu,
    /// CUDA GPU by index
    Cuda(usize),
}

impl Device {
    /// Returns true for GPU devices
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cuda(0)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(index) => write!(f, "cuda:{}", index),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        match lower.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            other => {
                let index = other
                    .strip_prefix("cuda:")
                    .or_else(|| other.strip_prefix("gpu:"))
                    .ok_or_else(|| format!("Unknown device: {}", s))?;
                index
                    .parse::<usize>()
                    .map(Device::Cuda)
                    .map_err(|_| format!("Invalid device index in {}", s))
            }
        }
    }
}

impl TryFrom<String> for Device {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Numeric precision a model is loaded with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit floats
    Full,
    /// 16-bit floats
    #[default]
    Half,
}

impl Precision {
    /// Bytes used per weight element
    pub fn bytes_per_element(&self) -> u64 {
        match self {
            Precision::Full => 4,
            Precision::Half => 2,
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precision::Full => write!(f, "full"),
            Precision::Half => write!(f, "half"),
        }
    }
}

/// Family a model loader belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    /// Complete diffusion model (U-Net, conditioner and decoder in one)
    Diffusion,
    /// Denoising U-Net stage
    DiffusionUnet,
    /// Text conditioning stage
    DiffusionConditioner,
    /// Latent decoder stage
    DiffusionDecoder,
    /// Image upscaler
    Upscaler,
    /// Face restoration model
    FaceRestorer,
    /// Latent super-resolution model
    SuperResolution,
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModelFamily::Diffusion => "diffusion",
            ModelFamily::DiffusionUnet => "diffusion_unet",
            ModelFamily::DiffusionConditioner => "diffusion_conditioner",
            ModelFamily::DiffusionDecoder => "diffusion_decoder",
            ModelFamily::Upscaler => "upscaler",
            ModelFamily::FaceRestorer => "face_restorer",
            ModelFamily::SuperResolution => "super_resolution",
        };
        write!(f, "{}", name)
    }
}

/// Opaque job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a fresh random job id
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }

    /// Returns the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Lifecycle state of a generation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "error", rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for a job slot
    Queued,
    /// Holding a slot and executing
    Running,
    /// Finished successfully
    Completed,
    /// Stopped early after observing a cancellation request
    Cancelled,
    /// Stopped by an unrecovered error
    Failed(String),
}

impl JobState {
    /// Returns true for Completed, Cancelled and Failed
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed(_))
    }

    /// Returns true if the job is running
    pub fn is_running(&self) -> bool {
        matches!(self, JobState::Running)
    }

    /// Gets the error message if the job failed
    pub fn error_message(&self) -> Option<&str> {
        match self {
            JobState::Failed(msg) => Some(msg),
            _ => None,
        }
    }

    /// Returns true if the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match (self, next) {
            (JobState::Queued, JobState::Running) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "Queued"),
            JobState::Running => write!(f, "Running"),
            JobState::Completed => write!(f, "Completed"),
            JobState::Cancelled => write!(f, "Cancelled"),
            JobState::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA:1".parse::<Device>().unwrap(), Device::Cuda(1));
        assert_eq!("gpu".parse::<Device>().unwrap(), Device::Cuda(0));
        assert!("tpu:0".parse::<Device>().is_err());
        assert!("cuda:x".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(2).to_string(), "cuda:2");
    }

    #[test]
    fn test_device_serde() {
        let json = serde_json::to_string(&Device::Cuda(3)).unwrap();
        assert_eq!(json, "\"cuda:3\"");
        let device: Device = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(device, Device::Cpu);
    }

    #[test]
    fn test_state_transitions() {
        assert!(JobState::Queued.can_transition_to(&JobState::Running));
        assert!(!JobState::Queued.can_transition_to(&JobState::Completed));
        assert!(JobState::Running.can_transition_to(&JobState::Cancelled));
        assert!(JobState::Running.can_transition_to(&JobState::Failed("boom".into())));
        assert!(!JobState::Running.can_transition_to(&JobState::Queued));
        assert!(!JobState::Completed.can_transition_to(&JobState::Running));
        assert!(!JobState::Cancelled.can_transition_to(&JobState::Completed));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(JobState::Queued.to_string(), "Queued");
        assert_eq!(JobState::Failed("oom".into()).to_string(), "Failed: oom");
        assert_eq!(JobState::Failed("oom".into()).error_message(), Some("oom"));
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
