//! Display unit systems and unit-category resolution

use std::fmt;
use std::str::FromStr;

use mb_config::HostUnitSystem;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Measurement system the bridge is asked to report in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    #[default]
    Metric,
    Imperial,
    /// Metric, except wind in km/h and distances in miles
    Uk,
}

impl UnitSystem {
    pub const ALL: [UnitSystem; 3] = [UnitSystem::Metric, UnitSystem::Imperial, UnitSystem::Uk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Imperial => "imperial",
            Self::Uk => "uk",
        }
    }

    /// Default display system for a host
    pub fn from_host(host: HostUnitSystem) -> Self {
        match host {
            HostUnitSystem::Metric => Self::Metric,
            HostUnitSystem::Imperial => Self::Imperial,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown unit system '{0}' (expected metric, imperial or uk)")]
pub struct UnknownUnitSystem(pub String);

impl FromStr for UnitSystem {
    type Err = UnknownUnitSystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "metric" => Ok(Self::Metric),
            "imperial" => Ok(Self::Imperial),
            "uk" => Ok(Self::Uk),
            _ => Err(UnknownUnitSystem(s.to_string())),
        }
    }
}

impl fmt::Display for UnitSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit family of a measurement whose unit depends on the unit system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitCategory {
    /// Unit is fixed by the catalog entry, or there is none
    None,
    Temperature,
    Pressure,
    Precipitation,
    PrecipitationRate,
    /// Wind speed
    Length,
    Distance,
    Density,
}

/// Category -> unit table reported by a data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitDescriptions {
    pub temperature: String,
    pub pressure: String,
    pub precipitation: String,
    pub precipitation_rate: String,
    pub length: String,
    pub distance: String,
    pub density: String,
}

impl UnitDescriptions {
    /// Units the bridge reports in when asked for `system`
    pub fn for_system(system: UnitSystem) -> Self {
        let (temperature, pressure, precipitation, precipitation_rate, length, distance, density) =
            match system {
                UnitSystem::Metric => ("°C", "hPa", "mm", "mm/h", "m/s", "km", "kg/m³"),
                UnitSystem::Imperial => ("°F", "inHg", "in", "in/h", "mph", "mi", "lb/ft³"),
                UnitSystem::Uk => ("°C", "hPa", "mm", "mm/h", "km/h", "mi", "kg/m³"),
            };

        Self {
            temperature: temperature.to_string(),
            pressure: pressure.to_string(),
            precipitation: precipitation.to_string(),
            precipitation_rate: precipitation_rate.to_string(),
            length: length.to_string(),
            distance: distance.to_string(),
            density: density.to_string(),
        }
    }

    pub fn resolve(&self, category: UnitCategory) -> Option<&str> {
        let unit = match category {
            UnitCategory::None => return None,
            UnitCategory::Temperature => &self.temperature,
            UnitCategory::Pressure => &self.pressure,
            UnitCategory::Precipitation => &self.precipitation,
            UnitCategory::PrecipitationRate => &self.precipitation_rate,
            UnitCategory::Length => &self.length,
            UnitCategory::Distance => &self.distance,
            UnitCategory::Density => &self.density,
        };
        (!unit.is_empty()).then_some(unit.as_str())
    }
}

impl Default for UnitDescriptions {
    fn default() -> Self {
        Self::for_system(UnitSystem::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_system() {
        assert_eq!("UK".parse::<UnitSystem>(), Ok(UnitSystem::Uk));
        assert_eq!(" imperial ".parse::<UnitSystem>(), Ok(UnitSystem::Imperial));
        assert!("nautical".parse::<UnitSystem>().is_err());
    }

    #[test]
    fn test_uk_mixes_metric_and_imperial() {
        let units = UnitDescriptions::for_system(UnitSystem::Uk);
        assert_eq!(units.resolve(UnitCategory::Temperature), Some("°C"));
        assert_eq!(units.resolve(UnitCategory::Pressure), Some("hPa"));
        assert_eq!(units.resolve(UnitCategory::Length), Some("km/h"));
        assert_eq!(units.resolve(UnitCategory::Distance), Some("mi"));
    }

    #[test]
    fn test_none_category_never_resolves() {
        for system in UnitSystem::ALL {
            let units = UnitDescriptions::for_system(system);
            assert_eq!(units.resolve(UnitCategory::None), None);
        }
    }

    #[test]
    fn test_empty_unit_is_unresolved() {
        let mut units = UnitDescriptions::default();
        units.density.clear();
        assert_eq!(units.resolve(UnitCategory::Density), None);
    }

    #[test]
    fn test_host_default() {
        assert_eq!(UnitSystem::from_host(HostUnitSystem::Imperial), UnitSystem::Imperial);
        assert_eq!(UnitSystem::from_host(HostUnitSystem::Metric), UnitSystem::Metric);
    }
}
