//! Typed bridge settings
//!
//! Entries store their settings as flat JSON maps: connection details in
//! `data`, reconfigurable settings in `options`. [`BridgeSettings`] is the
//! validated view of both, with defaults applied.

use std::collections::HashMap;
use std::time::Duration;

use mb_config::HostUnitSystem;
use mb_config_entries::{ConfigEntry, FlowInput};
use serde_json::{json, Value};
use thiserror::Error;

use crate::constants::*;
use crate::units::UnitSystem;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub host: String,
    pub username: String,
    pub password: String,
    pub unit_system: UnitSystem,
    pub language: String,
    /// How many of the less common measurements to request (0-2)
    pub extra_sensors: u8,
    pub scan_interval: Duration,
}

/// Read-only view over an entry's options layered on its data
trait Lookup {
    fn lookup(&self, key: &str) -> Option<&Value>;
}

impl Lookup for FlowInput {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.get(key).filter(|v| !v.is_null())
    }
}

struct Layered<'a> {
    options: &'a HashMap<String, Value>,
    data: &'a HashMap<String, Value>,
}

impl Lookup for Layered<'_> {
    fn lookup(&self, key: &str) -> Option<&Value> {
        self.options.lookup(key).or_else(|| self.data.lookup(key))
    }
}

impl BridgeSettings {
    /// Settings for a stored entry; options take precedence over data
    pub fn from_entry(
        entry: &ConfigEntry,
        host_units: HostUnitSystem,
    ) -> Result<Self, SettingsError> {
        Self::parse(
            &Layered {
                options: &entry.options,
                data: &entry.data,
            },
            host_units,
        )
    }

    /// Settings from flow input (user form or YAML import)
    pub fn from_input(
        input: &FlowInput,
        host_units: HostUnitSystem,
    ) -> Result<Self, SettingsError> {
        Self::parse(input, host_units)
    }

    fn parse(values: &dyn Lookup, host_units: HostUnitSystem) -> Result<Self, SettingsError> {
        let host = required_string(values, CONF_HOST)?;
        let password = required_string(values, CONF_PASSWORD)?;
        let username = optional_string(values, CONF_USERNAME)?
            .unwrap_or_else(|| DEFAULT_USERNAME.to_string());

        let unit_system = match optional_string(values, CONF_UNIT_SYSTEM)? {
            Some(s) => s
                .parse::<UnitSystem>()
                .map_err(|e| SettingsError::Invalid {
                    field: CONF_UNIT_SYSTEM,
                    reason: e.to_string(),
                })?,
            None => UnitSystem::from_host(host_units),
        };

        let language = optional_string(values, CONF_LANGUAGE)?
            .map(|l| l.to_ascii_lowercase())
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            return Err(SettingsError::Invalid {
                field: CONF_LANGUAGE,
                reason: format!("unsupported language '{}'", language),
            });
        }

        let extra_sensors = optional_int(
            values,
            CONF_EXTRA_SENSORS,
            0,
            MAX_EXTRA_SENSORS as u64,
        )?
        .map(|n| n as u8)
        .unwrap_or(DEFAULT_EXTRA_SENSORS);

        let scan_interval = optional_int(
            values,
            CONF_SCAN_INTERVAL,
            MIN_SCAN_INTERVAL,
            MAX_SCAN_INTERVAL,
        )?
        .unwrap_or(DEFAULT_SCAN_INTERVAL);

        Ok(Self {
            host,
            username,
            password,
            unit_system,
            language,
            extra_sensors,
            scan_interval: Duration::from_secs(scan_interval),
        })
    }

    /// Connection details stored as entry data
    pub fn to_data(&self) -> HashMap<String, Value> {
        HashMap::from([
            (CONF_HOST.to_string(), json!(self.host)),
            (CONF_USERNAME.to_string(), json!(self.username)),
            (CONF_PASSWORD.to_string(), json!(self.password)),
            (CONF_UNIT_SYSTEM.to_string(), json!(self.unit_system.as_str())),
            (CONF_LANGUAGE.to_string(), json!(self.language)),
            (CONF_EXTRA_SENSORS.to_string(), json!(self.extra_sensors)),
            (CONF_SCAN_INTERVAL.to_string(), json!(self.scan_interval.as_secs())),
        ])
    }

    /// Reconfigurable subset stored as entry options
    pub fn options(&self) -> HashMap<String, Value> {
        self.to_data()
            .into_iter()
            .filter(|(k, _)| OPTION_KEYS.contains(&k.as_str()))
            .collect()
    }
}

fn optional_string(
    values: &dyn Lookup,
    field: &'static str,
) -> Result<Option<String>, SettingsError> {
    match values.lookup(field) {
        None => Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(other) => Err(SettingsError::Invalid {
            field,
            reason: format!("expected a string, got {}", other),
        }),
    }
}

fn required_string(values: &dyn Lookup, field: &'static str) -> Result<String, SettingsError> {
    optional_string(values, field)?.ok_or(SettingsError::Missing(field))
}

/// Integer in `min..=max`; numeric strings are accepted
fn optional_int(
    values: &dyn Lookup,
    field: &'static str,
    min: u64,
    max: u64,
) -> Result<Option<u64>, SettingsError> {
    let Some(value) = values.lookup(field) else {
        return Ok(None);
    };

    let n = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .ok_or_else(|| SettingsError::Invalid {
        field,
        reason: format!("expected a non-negative integer, got {}", value),
    })?;

    if !(min..=max).contains(&n) {
        return Err(SettingsError::Invalid {
            field,
            reason: format!("{} is outside {}..={}", n, min, max),
        });
    }
    Ok(Some(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(pairs: &[(&str, Value)]) -> FlowInput {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_defaults_applied() {
        let settings = BridgeSettings::from_input(
            &input(&[("host", json!("10.0.0.5")), ("password", json!("pw"))]),
            HostUnitSystem::Imperial,
        )
        .unwrap();

        assert_eq!(settings.username, "meteobridge");
        assert_eq!(settings.unit_system, UnitSystem::Imperial);
        assert_eq!(settings.language, "en");
        assert_eq!(settings.extra_sensors, 0);
        assert_eq!(settings.scan_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_host() {
        let result = BridgeSettings::from_input(
            &input(&[("host", json!("  ")), ("password", json!("pw"))]),
            HostUnitSystem::Metric,
        );
        assert_eq!(result, Err(SettingsError::Missing("host")));
    }

    #[test]
    fn test_range_checks() {
        let base = [("host", json!("h")), ("password", json!("pw"))];

        for (field, value) in [
            ("scan_interval", json!(4)),
            ("scan_interval", json!(61)),
            ("extra_sensors", json!(3)),
            ("extra_sensors", json!(-1)),
            ("unit_system", json!("nautical")),
            ("language", json!("xx")),
        ] {
            let mut pairs = base.to_vec();
            pairs.push((field, value));
            assert!(
                matches!(
                    BridgeSettings::from_input(&input(&pairs), HostUnitSystem::Metric),
                    Err(SettingsError::Invalid { .. })
                ),
                "{} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_options_override_data() {
        let data = input(&[
            ("host", json!("10.0.0.5")),
            ("password", json!("pw")),
            ("scan_interval", json!(10)),
            ("unit_system", json!("metric")),
        ]);
        let options = input(&[("scan_interval", json!("30")), ("unit_system", json!("uk"))]);
        let entry = ConfigEntry::new(DOMAIN, "Bridge")
            .with_data(data)
            .with_options(options);

        let settings = BridgeSettings::from_entry(&entry, HostUnitSystem::Metric).unwrap();
        assert_eq!(settings.scan_interval, Duration::from_secs(30));
        assert_eq!(settings.unit_system, UnitSystem::Uk);
    }

    #[test]
    fn test_options_hold_only_reconfigurable_keys() {
        let settings = BridgeSettings::from_input(
            &input(&[("host", json!("10.0.0.5")), ("password", json!("pw"))]),
            HostUnitSystem::Metric,
        )
        .unwrap();

        let options = settings.options();
        assert_eq!(options.len(), OPTION_KEYS.len());
        assert!(!options.contains_key("password"));
        assert_eq!(options["unit_system"], json!("metric"));
    }
}
