//! Entity Registry
//!
//! Tracks every entity a bridge has ever published, keyed by its unique id,
//! so entity ids stay stable across restarts.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use indexmap::IndexMap;
use mb_core::EntityId;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::storage::{Storable, Storage, StorageResult};

pub const STORAGE_KEY: &str = "meteobridge.entity_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// A registered entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Internal ULID
    pub id: String,

    pub entity_id: EntityId,

    /// Stable id assigned by the integration
    pub unique_id: String,

    /// Integration that provides the entity
    pub platform: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_entry_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_icon: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_device_class: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

/// What an integration knows about an entity when registering it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRegistration {
    /// Preferred entity id; suffixed when already taken
    pub suggested_entity_id: EntityId,
    pub unique_id: String,
    pub platform: String,
    pub device_id: Option<String>,
    pub config_entry_id: Option<String>,
    pub original_name: Option<String>,
    pub original_icon: Option<String>,
    pub original_device_class: Option<String>,
    pub unit_of_measurement: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityRegistryData {
    pub entities: Vec<EntityEntry>,
}

impl Storable for EntityRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Entity registry with unique id, device and config-entry indexes
pub struct EntityRegistry {
    storage: Arc<Storage>,

    /// Primary index: entity_id -> EntityEntry, kept in registration order
    by_entity_id: RwLock<IndexMap<String, Arc<EntityEntry>>>,

    /// (platform, unique_id) -> entity_id
    by_unique_id: DashMap<(String, String), String>,

    /// device_id -> entity_ids
    by_device_id: DashMap<String, HashSet<String>>,

    /// config_entry_id -> entity_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl EntityRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_entity_id: RwLock::new(IndexMap::new()),
            by_unique_id: DashMap::new(),
            by_device_id: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<EntityRegistryData>().await? {
            info!("Loading {} entities from storage", data.entities.len());
            for entry in data.entities {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let entities: Vec<EntityEntry> = self
            .by_entity_id
            .read()
            .map(|e| e.values().map(|v| (**v).clone()).collect())
            .unwrap_or_default();
        let count = entities.len();

        self.storage.save(&EntityRegistryData { entities }).await?;
        debug!("Saved {} entities to storage", count);
        Ok(())
    }

    fn index_entry(&self, entry: Arc<EntityEntry>) {
        let entity_id = entry.entity_id.to_string();

        self.by_unique_id.insert(
            (entry.platform.clone(), entry.unique_id.clone()),
            entity_id.clone(),
        );

        if let Some(ref device_id) = entry.device_id {
            self.by_device_id
                .entry(device_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        if let Some(ref config_entry_id) = entry.config_entry_id {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(entity_id.clone());
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.insert(entity_id, entry);
        }
    }

    fn unindex_entry(&self, entry: &EntityEntry) {
        let entity_id = entry.entity_id.to_string();

        self.by_unique_id
            .remove(&(entry.platform.clone(), entry.unique_id.clone()));

        if let Some(ref device_id) = entry.device_id {
            if let Some(mut ids) = self.by_device_id.get_mut(device_id) {
                ids.remove(&entity_id);
            }
        }

        if let Some(ref config_entry_id) = entry.config_entry_id {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entity_id);
            }
        }

        if let Ok(mut idx) = self.by_entity_id.write() {
            idx.shift_remove(&entity_id);
        }
    }

    pub fn get(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_entity_id
            .read()
            .ok()
            .and_then(|idx| idx.get(entity_id).cloned())
    }

    pub fn get_by_unique_id(&self, platform: &str, unique_id: &str) -> Option<Arc<EntityEntry>> {
        self.by_unique_id
            .get(&(platform.to_string(), unique_id.to_string()))
            .and_then(|entity_id| self.get(&entity_id))
    }

    pub fn get_by_device_id(&self, device_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_device_id
            .get(device_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<EntityEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    fn is_taken(&self, entity_id: &EntityId) -> bool {
        self.by_entity_id
            .read()
            .map(|idx| idx.contains_key(&entity_id.to_string()))
            .unwrap_or(false)
    }

    /// First free entity id starting from `suggested`, then `_2`, `_3`...
    pub fn generate_entity_id(&self, suggested: &EntityId) -> EntityId {
        if !self.is_taken(suggested) {
            return suggested.clone();
        }
        (2u32..)
            .map(|n| suggested.with_suffix(n))
            .find(|candidate| !self.is_taken(candidate))
            .unwrap_or_else(|| suggested.clone())
    }

    /// Get or create the entry for `registration`
    ///
    /// A known unique id keeps its entity id; metadata is refreshed from the
    /// registration.
    pub fn get_or_create(&self, registration: &EntityRegistration) -> Arc<EntityEntry> {
        if let Some(existing) =
            self.get_by_unique_id(&registration.platform, &registration.unique_id)
        {
            let updated = self.update(&existing.entity_id.to_string(), |e| {
                e.device_id.clone_from(&registration.device_id);
                e.config_entry_id.clone_from(&registration.config_entry_id);
                e.original_name.clone_from(&registration.original_name);
                e.original_icon.clone_from(&registration.original_icon);
                e.original_device_class
                    .clone_from(&registration.original_device_class);
                e.unit_of_measurement
                    .clone_from(&registration.unit_of_measurement);
            });
            return updated.unwrap_or(existing);
        }

        let entity_id = self.generate_entity_id(&registration.suggested_entity_id);
        if entity_id != registration.suggested_entity_id {
            warn!(
                "Entity id {} already taken, registering {} as {}",
                registration.suggested_entity_id, registration.unique_id, entity_id
            );
        }

        let now = Utc::now();
        let entry = Arc::new(EntityEntry {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            entity_id,
            unique_id: registration.unique_id.clone(),
            platform: registration.platform.clone(),
            device_id: registration.device_id.clone(),
            config_entry_id: registration.config_entry_id.clone(),
            original_name: registration.original_name.clone(),
            original_icon: registration.original_icon.clone(),
            original_device_class: registration.original_device_class.clone(),
            unit_of_measurement: registration.unit_of_measurement.clone(),
            created_at: now,
            modified_at: now,
        });
        self.index_entry(Arc::clone(&entry));

        info!("Registered new entity: {}", entry.entity_id);
        entry
    }

    /// Apply `f` to an entity, re-indexing it afterwards
    pub fn update<F>(&self, entity_id: &str, f: F) -> Option<Arc<EntityEntry>>
    where
        F: FnOnce(&mut EntityEntry),
    {
        let current = self.get(entity_id)?;
        self.unindex_entry(&current);

        let mut entry = (*current).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Some(entry)
    }

    pub fn remove(&self, entity_id: &str) -> Option<Arc<EntityEntry>> {
        let entry = self.get(entity_id)?;
        self.unindex_entry(&entry);
        info!("Removed entity: {}", entity_id);
        Some(entry)
    }

    /// Remove every entity owned by a config entry, returning their ids
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<EntityId> {
        self.get_by_config_entry_id(config_entry_id)
            .into_iter()
            .filter_map(|entry| self.remove(&entry.entity_id.to_string()))
            .map(|entry| entry.entity_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_entity_id.read().map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
