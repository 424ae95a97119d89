//! Bridge lifecycle
//!
//! [`MeteobridgeIntegration`] is the [`EntrySetup`] handler for the
//! `meteobridge` domain. Each loaded config entry owns one
//! [`BridgeInstance`]: its coordinator, its projections and the task that
//! republishes their states whenever the coordinator refreshes. Nothing is
//! shared between instances.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use mb_config::HostUnitSystem;
use mb_config_entries::{ConfigEntries, ConfigEntry, ConfigEntryState, EntrySetup, SetupFailure};
use mb_registries::Registries;
use mb_state_machine::StateMachine;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::DOMAIN;
use crate::coordinator::DataUpdateCoordinator;
use crate::device::{bind, BindError, DeviceIdentity};
use crate::projection::{build_projections, EntityRecord, Projection};
use crate::settings::BridgeSettings;
use crate::source::{SourceError, SourceFactory};

/// Lifecycle of one configured bridge, derived from its entry and coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Unconfigured,
    /// Setting up, or waiting to retry after a transient failure
    Probing,
    /// Setup failed permanently; needs reconfiguration
    FailedTerminal,
    Ready,
    /// Loaded, but the latest refresh failed
    Degraded,
    TornDown,
}

pub type Projections = Arc<Vec<Box<dyn Projection>>>;

/// Runtime context of one loaded bridge
pub struct BridgeInstance {
    pub settings: BridgeSettings,
    pub identity: DeviceIdentity,
    pub device_id: String,
    pub coordinator: Arc<DataUpdateCoordinator>,
    pub projections: Projections,
    publisher: JoinHandle<()>,
}

impl BridgeInstance {
    /// Stop polling and publishing; returns once no further state writes can happen
    async fn shutdown(self) {
        self.coordinator.shutdown();
        self.publisher.abort();
        let _ = self.publisher.await;
    }
}

fn setup_failure(err: SourceError) -> SetupFailure {
    match err {
        SourceError::Auth(reason) => SetupFailure::Auth(reason),
        SourceError::Transient(reason) => SetupFailure::NotReady(reason),
    }
}

impl From<BindError> for SetupFailure {
    fn from(err: BindError) -> Self {
        match err {
            BindError::MissingIdentity => SetupFailure::NotReady(err.to_string()),
            BindError::DuplicateDevice { .. } => SetupFailure::Duplicate(err.to_string()),
        }
    }
}

/// Write every projection's current record to the state store
fn publish(states: &StateMachine, projections: &[Box<dyn Projection>]) {
    for projection in projections {
        let record = projection.record();
        states.set(record.entity_id, record.state, record.attributes);
    }
}

pub struct MeteobridgeIntegration {
    registries: Arc<Registries>,
    states: Arc<StateMachine>,
    factory: Arc<dyn SourceFactory>,
    host_units: HostUnitSystem,
    instances: DashMap<String, BridgeInstance>,
}

impl MeteobridgeIntegration {
    pub fn new(
        registries: Arc<Registries>,
        states: Arc<StateMachine>,
        factory: Arc<dyn SourceFactory>,
        host_units: HostUnitSystem,
    ) -> Self {
        Self {
            registries,
            states,
            factory,
            host_units,
            instances: DashMap::new(),
        }
    }

    /// Register as the handler for the `meteobridge` domain
    pub fn register(self: &Arc<Self>, entries: &ConfigEntries) {
        entries.register_handler(DOMAIN, Arc::clone(self) as Arc<dyn EntrySetup>);
    }

    pub fn host_units(&self) -> HostUnitSystem {
        self.host_units
    }

    pub fn is_loaded(&self, entry_id: &str) -> bool {
        self.instances.contains_key(entry_id)
    }

    pub fn loaded_entries(&self) -> Vec<String> {
        self.instances.iter().map(|r| r.key().clone()).collect()
    }

    pub fn coordinator(&self, entry_id: &str) -> Option<Arc<DataUpdateCoordinator>> {
        self.instances
            .get(entry_id)
            .map(|i| Arc::clone(&i.coordinator))
    }

    pub fn identity(&self, entry_id: &str) -> Option<DeviceIdentity> {
        self.instances.get(entry_id).map(|i| i.identity.clone())
    }

    pub fn projections(&self, entry_id: &str) -> Option<Projections> {
        self.instances
            .get(entry_id)
            .map(|i| Arc::clone(&i.projections))
    }

    /// Current record of every entity of a loaded bridge
    pub fn records(&self, entry_id: &str) -> Vec<EntityRecord> {
        self.projections(entry_id)
            .map(|p| p.iter().map(|p| p.record()).collect())
            .unwrap_or_default()
    }

    /// Lifecycle state of a bridge
    pub fn bridge_state(&self, entries: &ConfigEntries, entry_id: &str) -> BridgeState {
        let Some(state) = entries.state(entry_id) else {
            return BridgeState::TornDown;
        };

        match state {
            ConfigEntryState::NotLoaded => BridgeState::Unconfigured,
            ConfigEntryState::SetupInProgress | ConfigEntryState::SetupRetry => {
                BridgeState::Probing
            }
            ConfigEntryState::SetupError => BridgeState::FailedTerminal,
            ConfigEntryState::Loaded => match self.coordinator(entry_id) {
                Some(c) if c.last_update_success() => BridgeState::Ready,
                _ => BridgeState::Degraded,
            },
            ConfigEntryState::UnloadInProgress | ConfigEntryState::FailedUnload => {
                BridgeState::TornDown
            }
        }
    }

    async fn start_instance(&self, entry: &ConfigEntry) -> Result<BridgeInstance, SetupFailure> {
        let settings = BridgeSettings::from_entry(entry, self.host_units)
            .map_err(|e| SetupFailure::Config(e.to_string()))?;
        let source = self.factory.create(&settings);

        let info = source.fetch_device_info().await.map_err(setup_failure)?;
        let identity = DeviceIdentity::from_info(&info)?;

        let coordinator = DataUpdateCoordinator::new(
            identity.name.clone(),
            source.clone(),
            settings.scan_interval,
        );
        let first = coordinator.first_refresh().await.map_err(setup_failure)?;

        let device = bind(&self.registries.devices, &entry.entry_id, &identity)?;

        let units = source.unit_descriptions();
        let mut projections = build_projections(&coordinator, &first, &identity.key, &units)
            .map_err(|e| SetupFailure::Config(e.to_string()))?;

        for projection in projections.iter_mut() {
            let registered = self
                .registries
                .entities
                .get_or_create(&projection.registration(&device.id, &entry.entry_id));
            projection.set_entity_id(registered.entity_id.clone());
        }
        let projections: Projections = Arc::new(projections);

        publish(&self.states, &projections);

        let mut updates = coordinator.subscribe();
        let states = Arc::clone(&self.states);
        let published = Arc::clone(&projections);
        let publisher = tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => publish(&states, &published),
                    Err(RecvError::Closed) => break,
                }
            }
        });

        coordinator.start();

        if let Err(e) = self.registries.save_all().await {
            warn!("Failed to save registries for {}: {}", entry.title, e);
        }

        info!(
            "Bridge {} ready with {} entities",
            identity.name,
            projections.len()
        );

        Ok(BridgeInstance {
            settings,
            device_id: device.id.clone(),
            identity,
            coordinator,
            projections,
            publisher,
        })
    }
}

#[async_trait]
impl EntrySetup for MeteobridgeIntegration {
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupFailure> {
        debug!("Setting up bridge entry {}", entry.entry_id);

        let instance = self.start_instance(entry).await?;
        if let Some(previous) = self.instances.insert(entry.entry_id.clone(), instance) {
            warn!("Replacing running instance for {}", entry.entry_id);
            previous.shutdown().await;
        }
        Ok(())
    }

    async fn unload_entry(&self, entry: &ConfigEntry) -> bool {
        let Some((_, instance)) = self.instances.remove(&entry.entry_id) else {
            return true;
        };

        let name = instance.identity.name.clone();
        let projections = Arc::clone(&instance.projections);
        instance.shutdown().await;

        for projection in projections.iter() {
            self.states.remove(projection.entity_id());
        }

        info!("Unloaded bridge {}", name);
        true
    }

    async fn remove_entry(&self, entry: &ConfigEntry) {
        self.registries.clear_config_entry(&entry.entry_id);
        if let Err(e) = self.registries.save_all().await {
            warn!("Failed to save registries after removing {}: {}", entry.title, e);
        }
    }

    fn seed_options(&self, entry: &ConfigEntry) -> Option<HashMap<String, Value>> {
        BridgeSettings::from_entry(entry, self.host_units)
            .ok()
            .map(|settings| settings.options())
    }
}
