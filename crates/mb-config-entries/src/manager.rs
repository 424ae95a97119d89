//! Config Entries Manager
//!
//! Persists config entries and drives their setup/unload lifecycle through
//! the [`EntrySetup`] handler registered for each domain.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use mb_registries::{Storable, Storage, StorageResult};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate};
use crate::flow::FlowResult;
use crate::state_machine::{calculate_retry_delay, InvalidTransition};

pub const STORAGE_KEY: &str = "meteobridge.config_entries";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Why an integration could not set up an entry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SetupFailure {
    /// Credentials rejected; needs reconfiguration
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Device unreachable or misbehaving; retried with backoff
    #[error("not ready: {0}")]
    NotReady(String),

    /// Another entry already owns this device
    #[error("duplicate device: {0}")]
    Duplicate(String),

    /// Stored settings are unusable; needs reconfiguration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SetupFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SetupFailure::NotReady(_))
    }

    fn target_state(&self) -> ConfigEntryState {
        if self.is_retryable() {
            ConfigEntryState::SetupRetry
        } else {
            ConfigEntryState::SetupError
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Cannot unload entry in state {0:?}")]
    CannotUnload(ConfigEntryState),

    #[error("Setup failed: {0}")]
    SetupFailed(#[from] SetupFailure),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Flow did not create an entry")]
    NoEntryCreated,

    #[error("Storage error: {0}")]
    Storage(#[from] mb_registries::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Integration hooks for one domain
#[async_trait]
pub trait EntrySetup: Send + Sync {
    /// Bring the entry up
    async fn setup_entry(&self, entry: &ConfigEntry) -> Result<(), SetupFailure>;

    /// Tear the entry down; `false` if it could not be unloaded
    async fn unload_entry(&self, entry: &ConfigEntry) -> bool;

    /// Forget everything the entry registered; called after unload on removal
    async fn remove_entry(&self, _entry: &ConfigEntry) {}

    /// Options to store for an entry that has none yet
    fn seed_options(&self, _entry: &ConfigEntry) -> Option<HashMap<String, serde_json::Value>> {
        None
    }
}

/// Config Entries Manager
pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// domain -> entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    handlers: DashMap<String, Arc<dyn EntrySetup>>,

    /// Pending setup retries by entry_id
    retry_tasks: DashMap<String, JoinHandle<()>>,

    /// Handle on ourselves for scheduling retries
    this: Weak<ConfigEntries>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            handlers: DashMap::new(),
            retry_tasks: DashMap::new(),
            this: this.clone(),
        })
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<ConfigEntriesData>().await? {
            info!("Loading {} config entries from storage", data.entries.len());
            for entry in data.entries {
                self.index_entry(&entry);
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut entries: Vec<ConfigEntry> =
            self.entries.iter().map(|r| r.value().clone()).collect();
        entries.sort_by_key(|e| e.created_at);

        self.storage.save(&ConfigEntriesData { entries }).await?;
        debug!("Saved {} config entries to storage", self.entries.len());
        Ok(())
    }

    fn index_entry(&self, entry: &ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.entries.insert(entry_id.clone(), entry.clone());

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id);
        }
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove(&(entry.domain.clone(), unique_id.clone()));
        }

        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    pub fn state(&self, entry_id: &str) -> Option<ConfigEntryState> {
        self.entries.get(entry_id).map(|e| e.state)
    }

    /// Add a new config entry, rejecting duplicate unique ids
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            if self.get_by_unique_id(&entry.domain, unique_id).is_some() {
                return Err(ConfigEntriesError::AlreadyExists {
                    domain: entry.domain.clone(),
                    unique_id: unique_id.clone(),
                });
            }
        }

        self.index_entry(&entry);
        self.save().await?;

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );

        Ok(entry)
    }

    /// Turn a finished flow into a stored entry
    pub async fn add_from_flow(
        &self,
        domain: &str,
        source: ConfigEntrySource,
        result: FlowResult,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let FlowResult::CreateEntry {
            title,
            unique_id,
            data,
        } = result
        else {
            return Err(ConfigEntriesError::NoEntryCreated);
        };

        let mut entry = ConfigEntry::new(domain, title)
            .with_data(data)
            .with_source(source);
        entry.unique_id = unique_id;
        self.add(entry).await
    }

    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);

        let mut updated = entry;
        if let Some(title) = update.title {
            updated.title = title;
        }
        if let Some(data) = update.data {
            updated.data = data;
        }
        if let Some(options) = update.options {
            updated.options = options;
        }
        if let Some(unique_id) = update.unique_id {
            updated.unique_id = unique_id;
        }
        updated.modified_at = Utc::now();

        self.index_entry(&updated);
        self.save().await?;

        debug!("Updated config entry: {}", entry_id);
        Ok(updated)
    }

    /// Replace an entry's options and reload it if it was running
    pub async fn update_options(
        &self,
        entry_id: &str,
        options: HashMap<String, serde_json::Value>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let updated = self
            .update(entry_id, ConfigEntryUpdate::new().options(options))
            .await?;

        if updated.state != ConfigEntryState::NotLoaded {
            info!("Options changed for {}, reloading", updated.title);
            self.reload(entry_id).await?;
        }

        Ok(self.get(entry_id).unwrap_or(updated))
    }

    /// Remove an entry, unloading it and clearing its registrations first
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unload(entry_id).await?;

        if let Some(handler) = self.handler(&entry.domain) {
            handler.remove_entry(&entry).await;
        }

        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );

        Ok(entry)
    }

    fn transition(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(())
    }

    pub fn register_handler(&self, domain: &str, handler: Arc<dyn EntrySetup>) {
        self.handlers.insert(domain.to_string(), handler);
        debug!("Registered setup handler for domain: {}", domain);
    }

    fn handler(&self, domain: &str) -> Option<Arc<dyn EntrySetup>> {
        self.handlers.get(domain).map(|h| Arc::clone(h.value()))
    }

    /// Set up an entry through its domain handler
    ///
    /// A `NotReady` failure leaves the entry in `SetupRetry` with a retry
    /// scheduled after [`calculate_retry_delay`]; `Auth` and `Duplicate`
    /// leave it in `SetupError` with no retry.
    pub async fn setup(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let lock = Arc::clone(&entry.setup_lock);
        let _guard = lock.lock().await;

        if entry.is_disabled() {
            debug!("Skipping setup for disabled entry: {}", entry_id);
            return Ok(());
        }

        self.transition(entry_id, ConfigEntryState::SetupInProgress, None)?;

        // Re-read so the handler sees the latest options
        let mut entry = self.get(entry_id).unwrap_or(entry);

        let Some(handler) = self.handler(&entry.domain) else {
            self.transition(entry_id, ConfigEntryState::Loaded, None)?;
            debug!(
                "No setup handler for domain {}, marking as loaded",
                entry.domain
            );
            return Ok(());
        };

        if entry.options.is_empty() {
            if let Some(options) = handler.seed_options(&entry) {
                match self
                    .update(entry_id, ConfigEntryUpdate::new().options(options))
                    .await
                {
                    Ok(updated) => entry = updated,
                    Err(e) => warn!("Failed to store initial options for {}: {}", entry_id, e),
                }
            }
        }

        match handler.setup_entry(&entry).await {
            Ok(()) => {
                self.transition(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Setup completed for entry: {} ({})", entry.title, entry_id);
                Ok(())
            }
            Err(failure) => {
                self.transition(entry_id, failure.target_state(), Some(failure.to_string()))?;

                if failure.is_retryable() {
                    self.schedule_retry(entry_id);
                } else {
                    warn!("Setup failed for entry {}: {}", entry.title, failure);
                }
                Err(failure.into())
            }
        }
    }

    fn schedule_retry(&self, entry_id: &str) {
        let tries = self
            .entries
            .get_mut(entry_id)
            .map(|mut e| e.increment_tries())
            .unwrap_or(1);
        let delay = calculate_retry_delay(tries - 1);

        warn!(
            "Setup of {} not ready (attempt {}), retrying in {:.1}s",
            entry_id,
            tries,
            delay.as_secs_f64()
        );

        let this = self.this.clone();
        let id = entry_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = this.upgrade() else {
                return;
            };
            manager.retry_tasks.remove(&id);
            if manager.state(&id) == Some(ConfigEntryState::SetupRetry) {
                // Failures are logged and rescheduled inside setup
                let _ = manager.setup(&id).await;
            }
        });

        if let Some(previous) = self.retry_tasks.insert(entry_id.to_string(), task) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, task)) = self.retry_tasks.remove(entry_id) {
            task.abort();
            debug!("Cancelled pending setup retry for {}", entry_id);
        }
    }

    /// Unload an entry; a no-op for entries that are not loaded
    pub async fn unload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.cancel_retry(entry_id);

        let lock = Arc::clone(&entry.setup_lock);
        let _guard = lock.lock().await;

        let entry = self.get(entry_id).unwrap_or(entry);
        if entry.state == ConfigEntryState::NotLoaded {
            return Ok(());
        }
        if !entry.state.is_recoverable() {
            return Err(ConfigEntriesError::CannotUnload(entry.state));
        }

        let was_loaded = entry.is_loaded();
        self.transition(entry_id, ConfigEntryState::UnloadInProgress, None)?;

        let unloaded = match self.handler(&entry.domain) {
            Some(handler) if was_loaded => handler.unload_entry(&entry).await,
            _ => true,
        };

        if unloaded {
            self.transition(entry_id, ConfigEntryState::NotLoaded, None)?;
            info!("Unloaded entry: {} ({})", entry.title, entry_id);
        } else {
            self.transition(
                entry_id,
                ConfigEntryState::FailedUnload,
                Some("Integration refused to unload".to_string()),
            )?;
            warn!("Failed to unload entry: {} ({})", entry.title, entry_id);
        }
        Ok(())
    }

    pub async fn reload(&self, entry_id: &str) -> ConfigEntriesResult<()> {
        self.unload(entry_id).await?;
        self.setup(entry_id).await
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Set up every stored entry, one at a time
    pub async fn setup_all(&self) -> Vec<(String, ConfigEntriesResult<()>)> {
        let mut results = Vec::new();
        for entry_id in self.entry_ids() {
            let result = self.setup(&entry_id).await;
            results.push((entry_id, result));
        }
        results
    }

    /// Unload every entry, cancelling pending retries
    pub async fn unload_all(&self) {
        for entry_id in self.entry_ids() {
            if let Err(e) = self.unload(&entry_id).await {
                warn!("Failed to unload {}: {}", entry_id, e);
            }
        }
    }
}
