//! Model repository implementation
//!
//! Holds the registered loaders and the table of device-resident models.
//! Materialization (capacity check, eviction, load) is serialized under one
//! async acquisition lock. Reference counts and the resident table live
//! behind a short synchronous lock so a [`ModelHandle`] can be released from
//! `Drop` without awaiting.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{Device, ModelFamily};
use settings::ModelSettings;

use crate::budget::{MemoryBudget, MemoryUsage};
use crate::loader::{LoadedModel, LoaderSpec, ModelLoader, WeightsFileLoader};

/// A loader together with its registration-time snapshot
struct RegisteredLoader {
    spec: LoaderSpec,
    /// Registration order, breaks eviction ties
    order: usize,
    loader: Arc<dyn ModelLoader>,
}

/// A model currently materialized on a device
struct ResidentModel {
    device: Device,
    family: ModelFamily,
    /// Cost in budget units of the device
    cost: u64,
    memory_bytes: u64,
    order: usize,
    ref_count: usize,
    last_used: u64,
    model: LoadedModel,
}

#[derive(Default)]
struct DeviceLedger {
    used: u64,
    peak: u64,
}

#[derive(Default)]
struct ResidentTable {
    residents: HashMap<String, ResidentModel>,
    ledgers: HashMap<Device, DeviceLedger>,
    /// Logical clock for last-used stamps
    clock: u64,
}

impl ResidentTable {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Pins an existing resident and returns its model
    fn pin(&mut self, name: &str) -> Option<(Device, LoadedModel)> {
        let stamp = self.tick();
        let resident = self.residents.get_mut(name)?;
        resident.ref_count += 1;
        resident.last_used = stamp;
        Some((resident.device, resident.model.clone()))
    }

    fn used(&self, device: &Device) -> u64 {
        self.ledgers.get(device).map(|ledger| ledger.used).unwrap_or(0)
    }

    fn insert(&mut self, name: String, resident: ResidentModel) {
        let ledger = self.ledgers.entry(resident.device).or_default();
        ledger.used += resident.cost;
        ledger.peak = ledger.peak.max(ledger.used);
        self.residents.insert(name, resident);
    }

    /// Idle residents of a device in eviction order as `(name, cost)`.
    ///
    /// Oldest `last_used` first, then registration order. Stamps handed out by
    /// `tick` are unique, so the second key only orders residents whose stamps
    /// were assigned outside the clock.
    fn eviction_candidates(&self, device: &Device) -> Vec<(String, u64)> {
        let mut idle: Vec<_> = self
            .residents
            .iter()
            .filter(|(_, resident)| resident.device == *device && resident.ref_count == 0)
            .map(|(name, resident)| (resident.last_used, resident.order, resident.cost, name.clone()))
            .collect();
        idle.sort();
        idle.into_iter().map(|(_, _, cost, name)| (name, cost)).collect()
    }

    fn remove(&mut self, name: &str) -> Option<ResidentModel> {
        let resident = self.residents.remove(name)?;
        if let Some(ledger) = self.ledgers.get_mut(&resident.device) {
            ledger.used = ledger.used.saturating_sub(resident.cost);
        }
        Some(resident)
    }
}

/// Snapshot of one resident model
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentInfo {
    /// Loader name
    pub name: String,
    /// Device the model lives on
    pub device: Device,
    /// Model family
    pub family: ModelFamily,
    /// Cost in budget units
    pub cost: u64,
    /// Reported memory cost in bytes
    pub memory_bytes: u64,
    /// Outstanding handles
    pub ref_count: usize,
    /// Logical time of the last acquisition
    pub last_used: u64,
}

/// Repository of named models shared by concurrent jobs
pub struct ModelRepository {
    /// Registered loaders by name
    loaders: DashMap<String, Arc<RegisteredLoader>>,

    /// Next registration order
    next_order: AtomicUsize,

    /// Resident models and per-device accounting
    table: Arc<Mutex<ResidentTable>>,

    /// Serializes capacity check, eviction and load
    acquisition_lock: tokio::sync::Mutex<()>,

    /// Device for loaders that do not name one
    default_device: Device,

    /// Budget for devices without an explicit entry
    default_budget: MemoryBudget,

    /// Per-device budgets
    budgets: HashMap<Device, MemoryBudget>,
}

impl ModelRepository {
    /// Creates an empty repository with unlimited budgets
    pub fn new(default_device: Device) -> Self {
        Self {
            loaders: DashMap::new(),
            next_order: AtomicUsize::new(0),
            table: Arc::new(Mutex::new(ResidentTable::default())),
            acquisition_lock: tokio::sync::Mutex::new(()),
            default_device,
            default_budget: MemoryBudget::Unlimited,
            budgets: HashMap::new(),
        }
    }

    /// Sets the budget of one device
    pub fn with_budget(mut self, device: Device, budget: MemoryBudget) -> Self {
        self.budgets.insert(device, budget);
        self
    }

    /// Sets the budget of devices without an explicit entry
    pub fn with_default_budget(mut self, budget: MemoryBudget) -> Self {
        self.default_budget = budget;
        self
    }

    /// Builds a repository from configuration, registering every model that
    /// declares a weights file
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let mut repository = Self::new(settings.default_device)
            .with_default_budget(MemoryBudget::from_settings(&settings.default_budget)?);

        for entry in &settings.budgets {
            let budget = MemoryBudget::from_settings(&entry.budget())?;
            repository = repository.with_budget(entry.device, budget);
        }

        for spec in settings.models.iter().filter(|spec| spec.weights.is_some()) {
            let loader = WeightsFileLoader::from_settings(spec)?;
            repository.register(spec.name.clone(), Arc::new(loader))?;
        }

        Ok(repository)
    }

    /// Gets the default device
    pub fn default_device(&self) -> Device {
        self.default_device
    }

    /// Gets the budget that applies to a device
    pub fn budget(&self, device: &Device) -> MemoryBudget {
        self.budgets.get(device).copied().unwrap_or(self.default_budget)
    }

    /// Registers a loader under a unique name
    pub fn register(&self, name: impl Into<String>, loader: Arc<dyn ModelLoader>) -> Result<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument("Model name must not be empty".to_string()));
        }

        match self.loaders.entry(name) {
            Entry::Occupied(entry) => Err(Error::DuplicateLoader(entry.key().clone())),
            Entry::Vacant(entry) => {
                let spec = LoaderSpec::capture(entry.key(), loader.as_ref(), self.default_device);
                let order = self.next_order.fetch_add(1, Ordering::SeqCst);

                info!(
                    "Registered {} model {} on {} ({})",
                    spec.family,
                    spec.name,
                    spec.device,
                    common::utils::format_bytes(spec.memory_cost)
                );

                entry.insert(Arc::new(RegisteredLoader { spec, order, loader }));
                Ok(())
            }
        }
    }

    /// Returns true if a loader is registered and its backing resource is present.
    ///
    /// Never loads the model.
    pub fn is_loadable(&self, name: &str) -> bool {
        self.loaders
            .get(name)
            .map(|registered| registered.loader.is_available())
            .unwrap_or(false)
    }

    /// Returns the first loadable name of a priority list
    pub fn first_loadable<'a>(&self, names: &[&'a str]) -> Option<&'a str> {
        names.iter().copied().find(|name| self.is_loadable(name))
    }

    /// Gets the registration snapshot of a loader
    pub fn spec(&self, name: &str) -> Option<LoaderSpec> {
        self.loaders.get(name).map(|registered| registered.spec.clone())
    }

    /// Gets the names of all registered loaders in registration order
    pub fn registered(&self) -> Vec<String> {
        let mut entries: Vec<_> = self
            .loaders
            .iter()
            .map(|entry| (entry.value().order, entry.key().clone()))
            .collect();
        entries.sort();
        entries.into_iter().map(|(_, name)| name).collect()
    }

    /// Acquires a handle to a model, materializing it if needed.
    ///
    /// Evicts least recently used idle residents of the same device until the
    /// model fits. Nothing is evicted when no such set of residents frees
    /// enough room.
    pub async fn acquire(&self, name: &str) -> Result<ModelHandle> {
        let registered = self
            .loaders
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::UnknownModel(name.to_string()))?;

        if let Some(handle) = self.pin_resident(name) {
            debug!("Model {} already resident", name);
            return Ok(handle);
        }

        let _guard = self.acquisition_lock.lock().await;

        // Another acquisition may have loaded it while we waited
        if let Some(handle) = self.pin_resident(name) {
            debug!("Model {} loaded by a concurrent acquisition", name);
            return Ok(handle);
        }

        let spec = &registered.spec;
        let budget = self.budget(&spec.device);
        let cost = budget.cost_of(spec.memory_cost);

        let victims = self.select_victims(spec, budget, cost)?;
        for (victim_name, victim) in victims {
            self.release_resident(&victim_name, victim, "evicted").await;
        }

        info!("Loading model {} on {}", spec.name, spec.device);

        let model = registered.loader.load(&spec.device).await.map_err(|e| match e {
            Error::ModelLoad { reason, .. } => Error::model_load(&spec.name, reason),
            other => Error::model_load(&spec.name, other),
        })?;

        let mut table = self.table.lock();
        let stamp = table.tick();
        table.insert(
            spec.name.clone(),
            ResidentModel {
                device: spec.device,
                family: spec.family,
                cost,
                memory_bytes: spec.memory_cost,
                order: registered.order,
                ref_count: 1,
                last_used: stamp,
                model: model.clone(),
            },
        );

        info!(
            "Model {} resident on {}: {} unit(s) used, budget {}",
            spec.name,
            spec.device,
            table.used(&spec.device),
            budget
        );

        Ok(ModelHandle {
            name: spec.name.clone(),
            device: spec.device,
            model,
            table: self.table.clone(),
        })
    }

    fn pin_resident(&self, name: &str) -> Option<ModelHandle> {
        let (device, model) = self.table.lock().pin(name)?;
        Some(ModelHandle {
            name: name.to_string(),
            device,
            model,
            table: self.table.clone(),
        })
    }

    /// Picks and removes the residents to evict so `cost` units fit.
    ///
    /// Either the whole request is satisfiable and the victims are removed
    /// from the table, or nothing changes.
    fn select_victims(
        &self,
        spec: &LoaderSpec,
        budget: MemoryBudget,
        cost: u64,
    ) -> Result<Vec<(String, ResidentModel)>> {
        let mut table = self.table.lock();
        let capacity = budget.capacity();
        let used = table.used(&spec.device);
        let free = capacity.saturating_sub(used);

        if cost <= free {
            return Ok(Vec::new());
        }

        let idle = table.eviction_candidates(&spec.device);
        let idle_cost: u64 = idle.iter().map(|(_, cost)| cost).sum();
        let reclaimable = free.saturating_add(idle_cost);

        if cost > reclaimable {
            warn!(
                "Cannot fit model {} on {}: requires {} units, {} reclaimable of {}",
                spec.name, spec.device, cost, reclaimable, capacity
            );
            return Err(Error::InsufficientCapacity {
                name: spec.name.clone(),
                device: spec.device,
                required: cost,
                reclaimable,
                capacity,
            });
        }

        let mut available = free;
        let mut victims = Vec::new();
        for (victim_name, victim_cost) in idle {
            if available >= cost {
                break;
            }
            if let Some(victim) = table.remove(&victim_name) {
                available += victim_cost;
                victims.push((victim_name, victim));
            }
        }

        Ok(victims)
    }

    /// Hands a resident that has already left the table back to its loader
    async fn release_resident(&self, name: &str, resident: ResidentModel, reason: &str) {
        info!("Unloading model {} from {} ({})", name, resident.device, reason);

        let Some(registered) = self.loaders.get(name).map(|entry| entry.value().clone()) else {
            return;
        };

        if let Err(e) = registered.loader.unload(resident.model).await {
            warn!("Failed to unload model {}: {}", name, e);
        }
    }

    /// Returns true if the model is currently materialized
    pub fn is_resident(&self, name: &str) -> bool {
        self.table.lock().residents.contains_key(name)
    }

    /// Gets the number of outstanding handles of a model; zero if not resident
    pub fn ref_count(&self, name: &str) -> usize {
        self.table
            .lock()
            .residents
            .get(name)
            .map(|resident| resident.ref_count)
            .unwrap_or(0)
    }

    /// Gets a snapshot of every resident model, least recently used first
    pub fn resident_models(&self) -> Vec<ResidentInfo> {
        let table = self.table.lock();
        let mut residents: Vec<_> = table
            .residents
            .iter()
            .map(|(name, resident)| ResidentInfo {
                name: name.clone(),
                device: resident.device,
                family: resident.family,
                cost: resident.cost,
                memory_bytes: resident.memory_bytes,
                ref_count: resident.ref_count,
                last_used: resident.last_used,
            })
            .collect();
        residents.sort_by_key(|info| info.last_used);
        residents
    }

    /// Gets the usage of one device in budget units
    pub fn usage(&self, device: &Device) -> MemoryUsage {
        let table = self.table.lock();
        let (used, peak) = table
            .ledgers
            .get(device)
            .map(|ledger| (ledger.used, ledger.peak))
            .unwrap_or((0, 0));

        MemoryUsage {
            device: *device,
            used,
            capacity: self.budget(device).capacity(),
            peak,
            resident_count: table
                .residents
                .values()
                .filter(|resident| &resident.device == device)
                .count(),
        }
    }

    /// Gets the usage of every device that has held a model
    pub fn all_usage(&self) -> Vec<MemoryUsage> {
        let mut devices: Vec<Device> = self.table.lock().ledgers.keys().copied().collect();
        devices.sort();
        devices.iter().map(|device| self.usage(device)).collect()
    }

    /// Unloads an idle resident.
    ///
    /// Returns false if the model was not resident.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        if !self.loaders.contains_key(name) {
            return Err(Error::UnknownModel(name.to_string()));
        }

        let _guard = self.acquisition_lock.lock().await;

        let resident = {
            let mut table = self.table.lock();
            match table.residents.get(name) {
                None => return Ok(false),
                Some(resident) if resident.ref_count > 0 => {
                    return Err(Error::ModelInUse {
                        name: name.to_string(),
                        handles: resident.ref_count,
                    });
                }
                Some(_) => table.remove(name),
            }
        };

        if let Some(resident) = resident {
            self.release_resident(name, resident, "requested").await;
        }

        Ok(true)
    }

    /// Unloads every idle resident; pinned residents stay and are reported.
    ///
    /// Returns the number of models unloaded.
    pub async fn shutdown(&self) -> usize {
        let _guard = self.acquisition_lock.lock().await;

        let idle = {
            let mut table = self.table.lock();
            let names: Vec<String> = table
                .residents
                .iter()
                .filter_map(|(name, resident)| {
                    if resident.ref_count > 0 {
                        warn!(
                            "Model {} still has {} handle(s) at shutdown",
                            name, resident.ref_count
                        );
                        None
                    } else {
                        Some(name.clone())
                    }
                })
                .collect();

            names
                .into_iter()
                .filter_map(|name| table.remove(&name).map(|resident| (name, resident)))
                .collect::<Vec<_>>()
        };

        let count = idle.len();
        for (name, resident) in idle {
            self.release_resident(&name, resident, "shutdown").await;
        }

        info!("Model repository shut down, {} model(s) unloaded", count);
        count
    }
}

impl fmt::Debug for ModelRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRepository")
            .field("loaders", &self.registered())
            .field("default_device", &self.default_device)
            .field("default_budget", &self.default_budget)
            .field("budgets", &self.budgets)
            .finish()
    }
}

/// Scoped shared borrow of a resident model.
///
/// The model is never evicted while a handle exists. Dropping the handle
/// releases the borrow; cloning takes another.
pub struct ModelHandle {
    name: String,
    device: Device,
    model: LoadedModel,
    table: Arc<Mutex<ResidentTable>>,
}

impl ModelHandle {
    /// Gets the loader name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the device the model lives on
    pub fn device(&self) -> Device {
        self.device
    }

    /// Gets the type-erased model
    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    /// Gets the model as a concrete type
    pub fn downcast_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.model.downcast_ref::<T>()
    }
}

impl Clone for ModelHandle {
    fn clone(&self) -> Self {
        if let Some(resident) = self.table.lock().residents.get_mut(&self.name) {
            resident.ref_count += 1;
        }

        Self {
            name: self.name.clone(),
            device: self.device,
            model: self.model.clone(),
            table: self.table.clone(),
        }
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if let Some(resident) = self.table.lock().residents.get_mut(&self.name) {
            resident.ref_count = resident.ref_count.saturating_sub(1);
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.name)
            .field("device", &self.device)
            .finish()
    }
}
