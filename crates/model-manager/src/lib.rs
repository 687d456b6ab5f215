//! Model residency management for Diffusion Orchestrator
//!
//! This crate provides the model repository: named loaders, lazily
//! materialized device-resident models, capacity-driven LRU eviction and
//! reference-counted handles.

pub mod budget;
pub mod loader;
pub mod repository;

// Re-export commonly used types
pub use budget::{MemoryBudget, MemoryUsage};
pub use loader::{
    estimate_memory_cost, LoadedModel, LoaderSpec, ModelLoader, RawWeights, WeightsConstructor,
    WeightsFileLoader,
};
pub use repository::{ModelHandle, ModelRepository, ResidentInfo};
