//! Typed view of `configuration.yaml`
//!
//! ```yaml
//! core:
//!   name: Home
//!   unit_system: metric
//!   language: en
//!
//! meteobridge:
//!   - host: 192.168.1.20
//!     password: !secret bridge_password
//!     unit_system: uk
//!     scan_interval: 30
//! ```
//!
//! Bridge settings are kept loosely typed here; the integration's import
//! step applies defaults and range checks exactly as the setup form does.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::load_yaml;

pub const CONFIG_FILE: &str = "configuration.yaml";

/// Measurement system of the host installation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostUnitSystem {
    #[default]
    Metric,
    Imperial,
}

impl HostUnitSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
        }
    }
}

/// The `core:` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub unit_system: HostUnitSystem,

    #[serde(default = "default_language")]
    pub language: String,
}

fn default_name() -> String {
    "Home".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            unit_system: HostUnitSystem::default(),
            language: default_language(),
        }
    }
}

/// One entry of the `meteobridge:` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    pub password: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_sensors: Option<u8>,

    /// Seconds between polls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_interval: Option<u64>,
}

impl BridgeConfig {
    /// Flat key/value form handed to the import step
    pub fn to_input(&self) -> HashMap<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
            _ => HashMap::new(),
        }
    }
}

/// Everything the server reads from `configuration.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub core: CoreConfig,

    #[serde(default)]
    pub meteobridge: Vec<BridgeConfig>,
}

impl ServerConfig {
    /// Load from `<config_dir>/configuration.yaml`; a missing file yields defaults
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        if !config_dir.join(CONFIG_FILE).exists() {
            tracing::info!("No {} in {:?}, using defaults", CONFIG_FILE, config_dir);
            return Ok(Self::default());
        }

        let yaml = load_yaml(config_dir, CONFIG_FILE)?;
        Self::from_yaml(yaml)
    }

    pub fn from_yaml(yaml: Value) -> ConfigResult<Self> {
        if yaml.is_null() {
            return Ok(Self::default());
        }
        if !yaml.is_mapping() {
            return Err(ConfigError::InvalidValue {
                key: "root".to_string(),
                reason: "configuration must be a mapping".to_string(),
            });
        }

        serde_yaml::from_value(yaml).map_err(|e| ConfigError::InvalidValue {
            key: "configuration.yaml".to_string(),
            reason: e.to_string(),
        })
    }
}
