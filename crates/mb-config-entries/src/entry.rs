//! Config Entry types
//!
//! A ConfigEntry is one configured bridge: the setup inputs in `data`,
//! the reconfigurable subset in `options`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::state_machine::InvalidTransition;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Not set up yet, or unloaded
    #[default]
    NotLoaded,
    /// Setup running
    SetupInProgress,
    /// Set up and running
    Loaded,
    /// Setup failed permanently (bad credentials, duplicate device)
    SetupError,
    /// Setup failed transiently, waiting to retry
    SetupRetry,
    /// Unload running
    UnloadInProgress,
    /// Unload failed
    FailedUnload,
}

impl ConfigEntryState {
    /// Whether the entry can be unloaded or reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }
}

/// How the config entry was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Interactive setup form
    #[default]
    User,
    /// Imported from `configuration.yaml`
    Import,
}

/// Reason an entry was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryDisabledBy {
    User,
}

/// A configuration entry for one bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Setup inputs, persisted as given
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,

    /// Reconfigurable subset of the setup inputs
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,

    #[serde(default = "default_version")]
    pub version: u32,

    /// Duplicate prevention key (the bridge's identity key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Explanation for failed states (not persisted)
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Per-entry setup/unload lock (not persisted)
    #[serde(skip)]
    pub setup_lock: Arc<Mutex<()>>,

    /// Setup retry attempts so far (not persisted)
    #[serde(skip, default)]
    pub tries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_by: Option<ConfigEntryDisabledBy>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            options: HashMap::new(),
            version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            setup_lock: Arc::new(Mutex::new(())),
            tries: 0,
            disabled_by: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_by.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Typed value from `data`
    pub fn data_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Typed value from `options`, falling back to `data`
    pub fn value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.options
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .or_else(|| self.data_value(key))
    }

    /// Validated state transition
    ///
    /// The retry counter survives only retry-related states.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;

        self.state = new_state;
        self.reason = reason;

        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }

        Ok(())
    }

    pub fn increment_tries(&mut self) -> u32 {
        self.tries += 1;
        self.tries
    }
}

/// Partial update for a config entry
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, serde_json::Value>>,
    pub options: Option<HashMap<String, serde_json::Value>>,
    pub unique_id: Option<Option<String>>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: HashMap<String, serde_json::Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: HashMap<String, serde_json::Value>) -> Self {
        self.options = Some(options);
        self
    }
}
