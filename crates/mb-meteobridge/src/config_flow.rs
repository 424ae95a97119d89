//! Config and options flows for bridges

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mb_config::HostUnitSystem;
use mb_config_entries::{
    ConfigEntries, ConfigEntry, ConfigFlow, FieldType, FlowInput, FlowResult, FormField,
    OptionsFlow, BASE_ERROR,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::device::identity_key;
use crate::settings::{BridgeSettings, SettingsError};
use crate::source::{DeviceInfo, SourceError, SourceFactory};
use crate::units::UnitSystem;

const STEP_USER: &str = "user";
const STEP_INIT: &str = "init";

/// Error key for a single form field
const ERROR_REQUIRED: &str = "required";
const ERROR_INVALID_VALUE: &str = "invalid_value";

fn unit_system_field(default: UnitSystem) -> FormField {
    FormField::optional(
        CONF_UNIT_SYSTEM,
        FieldType::Select {
            options: UnitSystem::ALL.iter().map(|u| u.as_str().to_string()).collect(),
        },
    )
    .with_default(default.as_str())
}

fn language_field(default: &str) -> FormField {
    FormField::optional(
        CONF_LANGUAGE,
        FieldType::Select {
            options: SUPPORTED_LANGUAGES.iter().map(|l| l.to_string()).collect(),
        },
    )
    .with_default(default)
}

fn extra_sensors_field(default: u8) -> FormField {
    FormField::optional(
        CONF_EXTRA_SENSORS,
        FieldType::Integer {
            min: 0,
            max: MAX_EXTRA_SENSORS as i64,
        },
    )
    .with_default(default)
}

fn scan_interval_field(default: u64) -> FormField {
    FormField::optional(
        CONF_SCAN_INTERVAL,
        FieldType::Integer {
            min: MIN_SCAN_INTERVAL as i64,
            max: MAX_SCAN_INTERVAL as i64,
        },
    )
    .with_default(default)
}

fn form_with_errors(
    step_id: &str,
    schema: Vec<FormField>,
    errors: HashMap<String, String>,
) -> FlowResult {
    FlowResult::Form {
        step_id: step_id.to_string(),
        data_schema: schema,
        errors,
    }
}

fn settings_errors(err: &SettingsError) -> HashMap<String, String> {
    let (field, key) = match err {
        SettingsError::Missing(field) => (*field, ERROR_REQUIRED),
        SettingsError::Invalid { field, .. } => (*field, ERROR_INVALID_VALUE),
    };
    HashMap::from([(field.to_string(), key.to_string())])
}

/// Creates bridge entries from the setup form or from YAML
pub struct MeteobridgeConfigFlow {
    entries: Arc<ConfigEntries>,
    factory: Arc<dyn SourceFactory>,
    host_units: HostUnitSystem,
}

impl MeteobridgeConfigFlow {
    pub fn new(
        entries: Arc<ConfigEntries>,
        factory: Arc<dyn SourceFactory>,
        host_units: HostUnitSystem,
    ) -> Self {
        Self {
            entries,
            factory,
            host_units,
        }
    }

    fn user_schema(&self) -> Vec<FormField> {
        vec![
            FormField::required(CONF_HOST, FieldType::String),
            FormField::required(CONF_USERNAME, FieldType::String).with_default(DEFAULT_USERNAME),
            FormField::required(CONF_PASSWORD, FieldType::Password),
            unit_system_field(UnitSystem::from_host(self.host_units)),
            language_field(DEFAULT_LANGUAGE),
            extra_sensors_field(DEFAULT_EXTRA_SENSORS),
            scan_interval_field(DEFAULT_SCAN_INTERVAL),
        ]
    }

    /// Contact the bridge; the error is a flow error key
    async fn validate_bridge(
        &self,
        settings: &BridgeSettings,
    ) -> Result<(DeviceInfo, String), &'static str> {
        let source = self.factory.create(settings);
        let info = source.fetch_device_info().await.map_err(|e| {
            debug!("Contacting {} failed: {}", settings.host, e);
            match e {
                SourceError::Auth(_) => ERROR_INVALID_CREDENTIALS,
                SourceError::Transient(_) => ERROR_HOST_NOT_FOUND,
            }
        })?;
        let key = identity_key(&info).map_err(|_| ERROR_HOST_NOT_FOUND)?;
        Ok((info, key))
    }

    fn is_configured(&self, unique_id: &str) -> bool {
        self.entries.get_by_unique_id(DOMAIN, unique_id).is_some()
    }

    fn create_entry(settings: &BridgeSettings, info: &DeviceInfo, unique_id: String) -> FlowResult {
        FlowResult::CreateEntry {
            title: format!("{} ({})", info.model, settings.host),
            unique_id: Some(unique_id),
            data: settings.to_data(),
        }
    }
}

#[async_trait]
impl ConfigFlow for MeteobridgeConfigFlow {
    async fn step_user(&self, user_input: Option<FlowInput>) -> FlowResult {
        let Some(input) = user_input else {
            return FlowResult::form(STEP_USER, self.user_schema());
        };

        let settings = match BridgeSettings::from_input(&input, self.host_units) {
            Ok(settings) => settings,
            Err(e) => return form_with_errors(STEP_USER, self.user_schema(), settings_errors(&e)),
        };

        let (info, unique_id) = match self.validate_bridge(&settings).await {
            Ok(validated) => validated,
            Err(key) => {
                let errors = HashMap::from([(BASE_ERROR.to_string(), key.to_string())]);
                return form_with_errors(STEP_USER, self.user_schema(), errors);
            }
        };

        if self.is_configured(&unique_id) {
            return FlowResult::abort(ABORT_ALREADY_CONFIGURED);
        }

        info!("Configured bridge {} at {}", info.model, settings.host);
        Self::create_entry(&settings, &info, unique_id)
    }

    async fn step_import(&self, import_data: FlowInput) -> FlowResult {
        let settings = match BridgeSettings::from_input(&import_data, self.host_units) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring invalid bridge configuration: {}", e);
                return FlowResult::abort(ERROR_INVALID_VALUE);
            }
        };

        let already_imported = self
            .entries
            .get_by_domain(DOMAIN)
            .iter()
            .any(|e| e.data_value::<String>(CONF_HOST).as_deref() == Some(settings.host.as_str()));
        if already_imported {
            debug!("Bridge {} already configured, skipping import", settings.host);
            return FlowResult::abort(ABORT_ALREADY_CONFIGURED);
        }

        let (info, unique_id) = match self.validate_bridge(&settings).await {
            Ok(validated) => validated,
            Err(key) => {
                warn!("Could not import bridge {}: {}", settings.host, key);
                return FlowResult::abort(key);
            }
        };

        if self.is_configured(&unique_id) {
            return FlowResult::abort(ABORT_ALREADY_CONFIGURED);
        }

        info!("Imported bridge {} at {}", info.model, settings.host);
        Self::create_entry(&settings, &info, unique_id)
    }
}

/// Edits the reconfigurable settings of an existing bridge
///
/// A `CreateEntry` result carries the new options in `data`; store them
/// with [`ConfigEntries::update_options`], which reloads the bridge.
pub struct MeteobridgeOptionsFlow {
    host_units: HostUnitSystem,
}

impl MeteobridgeOptionsFlow {
    pub fn new(host_units: HostUnitSystem) -> Self {
        Self { host_units }
    }

    fn schema(current: &BridgeSettings) -> Vec<FormField> {
        vec![
            unit_system_field(current.unit_system),
            language_field(&current.language),
            extra_sensors_field(current.extra_sensors),
            scan_interval_field(current.scan_interval.as_secs()),
        ]
    }
}

#[async_trait]
impl OptionsFlow for MeteobridgeOptionsFlow {
    async fn step_init(&self, entry: &ConfigEntry, user_input: Option<FlowInput>) -> FlowResult {
        let current = match BridgeSettings::from_entry(entry, self.host_units) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Entry {} has unusable settings: {}", entry.entry_id, e);
                return FlowResult::abort(ERROR_INVALID_VALUE);
            }
        };

        let Some(input) = user_input else {
            return FlowResult::form(STEP_INIT, Self::schema(&current));
        };

        let mut options: HashMap<String, Value> = current.options();
        options.extend(
            input
                .into_iter()
                .filter(|(k, _)| OPTION_KEYS.contains(&k.as_str())),
        );

        let candidate = entry.clone().with_options(options);
        match BridgeSettings::from_entry(&candidate, self.host_units) {
            Ok(updated) => FlowResult::CreateEntry {
                title: entry.title.clone(),
                unique_id: None,
                data: updated.options(),
            },
            Err(e) => form_with_errors(STEP_INIT, Self::schema(&current), settings_errors(&e)),
        }
    }
}
