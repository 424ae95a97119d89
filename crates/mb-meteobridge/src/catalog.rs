//! Entity catalog
//!
//! Static description tables for every measurement the integration knows
//! how to publish. A description is turned into a projection when it is
//! flagged `always_add` or when its key is present in the first snapshot
//! fetched from the bridge.

use std::collections::HashSet;

use mb_core::Readings;
use serde::Serialize;
use thiserror::Error;

use crate::units::{UnitCategory, UnitDescriptions, UnitSystem};

pub const PERCENTAGE: &str = "%";
pub const DEGREE: &str = "°";
pub const IRRADIANCE: &str = "W/m²";
pub const UV_INDEX: &str = "UVI";
pub const CENTIBAR: &str = "cb";

/// How the host should aggregate a sensor's history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    TotalIncreasing,
}

impl StateClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Measurement => "measurement",
            Self::TotalIncreasing => "total_increasing",
        }
    }
}

/// Presentation metadata for one numeric or textual measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub unit_category: UnitCategory,
    /// Unit that does not depend on the unit system
    pub native_unit: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub state_class: Option<StateClass>,
    pub icon: Option<&'static str>,
    pub always_add: bool,
    /// Second snapshot field exposed as an attribute, e.g. the time of a maximum
    pub companion: Option<&'static str>,
}

impl SensorDescription {
    pub const fn new(key: &'static str, name: &'static str) -> Self {
        Self {
            key,
            name,
            unit_category: UnitCategory::None,
            native_unit: None,
            device_class: None,
            state_class: None,
            icon: None,
            always_add: false,
            companion: None,
        }
    }

    pub const fn unit(self, unit: &'static str) -> Self {
        Self {
            native_unit: Some(unit),
            ..self
        }
    }

    pub const fn category(self, unit_category: UnitCategory) -> Self {
        Self {
            unit_category,
            ..self
        }
    }

    pub const fn device_class(self, device_class: &'static str) -> Self {
        Self {
            device_class: Some(device_class),
            ..self
        }
    }

    pub const fn measurement(self) -> Self {
        Self {
            state_class: Some(StateClass::Measurement),
            ..self
        }
    }

    pub const fn total_increasing(self) -> Self {
        Self {
            state_class: Some(StateClass::TotalIncreasing),
            ..self
        }
    }

    pub const fn icon(self, icon: &'static str) -> Self {
        Self {
            icon: Some(icon),
            ..self
        }
    }

    pub const fn always(self) -> Self {
        Self {
            always_add: true,
            ..self
        }
    }

    pub const fn companion(self, key: &'static str) -> Self {
        Self {
            companion: Some(key),
            ..self
        }
    }

    const fn temperature(key: &'static str, name: &'static str) -> Self {
        Self::new(key, name)
            .category(UnitCategory::Temperature)
            .device_class("temperature")
            .measurement()
            .icon("mdi:thermometer")
    }

    const fn wind_speed(key: &'static str, name: &'static str) -> Self {
        Self::new(key, name)
            .category(UnitCategory::Length)
            .device_class("wind_speed")
            .measurement()
            .icon("mdi:weather-windy")
    }

    const fn rain_total(key: &'static str, name: &'static str) -> Self {
        Self::new(key, name)
            .category(UnitCategory::Precipitation)
            .device_class("precipitation")
            .total_increasing()
            .icon("mdi:weather-rainy")
    }

    const fn text(key: &'static str, name: &'static str, icon: &'static str) -> Self {
        Self::new(key, name).icon(icon)
    }

    /// Whether a projection should be created for this entry
    pub fn is_instantiated(&self, first: &Readings) -> bool {
        self.always_add || first.contains(self.key)
    }
}

/// Presentation metadata for one on/off measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinarySensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    /// `"<icon when on>,<icon when off>"`
    pub icon_pair: &'static str,
    pub device_class: Option<&'static str>,
    pub always_add: bool,
}

impl BinarySensorDescription {
    pub const fn new(key: &'static str, name: &'static str, icon_pair: &'static str) -> Self {
        Self {
            key,
            name,
            icon_pair,
            device_class: None,
            always_add: false,
        }
    }

    pub const fn device_class(self, device_class: &'static str) -> Self {
        Self {
            device_class: Some(device_class),
            ..self
        }
    }

    pub const fn always(self) -> Self {
        Self {
            always_add: true,
            ..self
        }
    }

    /// `(on, off)` icons; `None` if the pair is malformed
    pub fn icons(&self) -> Option<(&'static str, &'static str)> {
        let (on, off) = self.icon_pair.split_once(',')?;
        let (on, off) = (on.trim(), off.trim());
        if on.is_empty() || off.is_empty() || off.contains(',') {
            return None;
        }
        Some((on, off))
    }

    pub fn is_instantiated(&self, first: &Readings) -> bool {
        self.always_add || first.contains(self.key)
    }
}

pub static SENSORS: &[SensorDescription] = &[
    SensorDescription::temperature("air_temperature", "Temperature").always(),
    SensorDescription::temperature("air_temperature_dmax", "Temp High Today")
        .companion("air_temperature_dmaxtime"),
    SensorDescription::temperature("air_temperature_dmin", "Temp Low Today")
        .companion("air_temperature_dmintime"),
    SensorDescription::temperature("air_temperature_mmax", "Temp High Month"),
    SensorDescription::temperature("air_temperature_mmin", "Temp Low Month"),
    SensorDescription::temperature("air_temperature_ymax", "Temp High Year"),
    SensorDescription::temperature("air_temperature_ymin", "Temp Low Year"),
    SensorDescription::temperature("indoor_temperature", "Indoor Temperature")
        .icon("mdi:home-thermometer"),
    SensorDescription::temperature("dew_point", "Dew Point"),
    SensorDescription::temperature("feels_like", "Feels Like"),
    SensorDescription::temperature("heat_index", "Heat Index"),
    SensorDescription::temperature("wind_chill", "Wind Chill"),
    SensorDescription::temperature("soil_temperature", "Soil Temperature"),
    SensorDescription::new("relative_humidity", "Humidity")
        .unit(PERCENTAGE)
        .device_class("humidity")
        .measurement()
        .icon("mdi:water-percent")
        .always(),
    SensorDescription::new("indoor_humidity", "Indoor Humidity")
        .unit(PERCENTAGE)
        .device_class("humidity")
        .measurement()
        .icon("mdi:water-percent"),
    SensorDescription::new("sealevel_pressure", "Sea Level Pressure")
        .category(UnitCategory::Pressure)
        .device_class("pressure")
        .measurement()
        .icon("mdi:gauge"),
    SensorDescription::text("pressure_trend", "Pressure Trend", "mdi:trending-up"),
    SensorDescription::text("temperature_trend", "Temperature Trend", "mdi:trending-up"),
    SensorDescription::wind_speed("wind_avg", "Wind Speed"),
    SensorDescription::wind_speed("wind_gust", "Wind Gust"),
    SensorDescription::new("wind_bearing", "Wind Bearing")
        .unit(DEGREE)
        .measurement()
        .icon("mdi:compass-outline"),
    SensorDescription::text("wind_cardinal", "Wind Direction", "mdi:compass-outline"),
    SensorDescription::new("beaufort", "Beaufort Scale")
        .measurement()
        .icon("mdi:windsock"),
    SensorDescription::text("beaufort_description", "Beaufort Description", "mdi:windsock"),
    SensorDescription::new("precip_rate", "Rain Rate")
        .category(UnitCategory::PrecipitationRate)
        .device_class("precipitation_intensity")
        .measurement()
        .icon("mdi:weather-pouring"),
    SensorDescription::rain_total("precip_accum_local_day", "Rain Today"),
    SensorDescription::rain_total("precip_accum_month", "Rain This Month"),
    SensorDescription::rain_total("precip_accum_year", "Rain This Year"),
    SensorDescription::new("uv", "UV Index")
        .unit(UV_INDEX)
        .measurement()
        .icon("mdi:weather-sunny-alert"),
    SensorDescription::text("uv_description", "UV Description", "mdi:weather-sunny-alert"),
    SensorDescription::new("solar_radiation", "Solar Radiation")
        .unit(IRRADIANCE)
        .device_class("irradiance")
        .measurement()
        .icon("mdi:weather-sunny"),
    SensorDescription::new("visibility", "Visibility")
        .category(UnitCategory::Distance)
        .device_class("distance")
        .measurement()
        .icon("mdi:eye"),
    SensorDescription::new("air_density", "Air Density")
        .category(UnitCategory::Density)
        .measurement()
        .icon("mdi:air-filter"),
    SensorDescription::new("lightning_strike_count", "Lightning Count")
        .total_increasing()
        .icon("mdi:flash"),
    SensorDescription::new("lightning_strike_last_distance", "Lightning Distance")
        .category(UnitCategory::Distance)
        .device_class("distance")
        .measurement()
        .icon("mdi:flash"),
    SensorDescription::new("lightning_strike_last_epoch", "Last Lightning Strike")
        .device_class("timestamp")
        .icon("mdi:flash"),
    SensorDescription::new("soil_moisture", "Soil Moisture")
        .unit(CENTIBAR)
        .measurement()
        .icon("mdi:water-outline"),
    SensorDescription::new("leaf_wetness", "Leaf Wetness")
        .measurement()
        .icon("mdi:leaf"),
    SensorDescription::text("forecast", "Forecast", "mdi:text-short"),
];

pub static BINARY_SENSORS: &[BinarySensorDescription] = &[
    BinarySensorDescription::new("is_raining", "Is Raining", "mdi:water,mdi:water-off")
        .device_class("moisture")
        .always(),
    BinarySensorDescription::new("is_lowbat", "Low Battery", "mdi:battery-10,mdi:battery")
        .device_class("battery"),
    BinarySensorDescription::new(
        "is_freezing",
        "Is Freezing",
        "mdi:thermometer-minus,mdi:thermometer-plus",
    )
    .device_class("cold"),
    BinarySensorDescription::new("is_lightning", "Is Lightning", "mdi:flash,mdi:flash-off"),
];

pub fn sensor(key: &str) -> Option<&'static SensorDescription> {
    SENSORS.iter().find(|d| d.key == key)
}

pub fn binary_sensor(key: &str) -> Option<&'static BinarySensorDescription> {
    BINARY_SENSORS.iter().find(|d| d.key == key)
}

/// Sensor descriptions to instantiate for a bridge whose first snapshot is `first`
pub fn sensors_for(first: &Readings) -> impl Iterator<Item = &'static SensorDescription> + '_ {
    SENSORS.iter().filter(move |d| d.is_instantiated(first))
}

pub fn binary_sensors_for(
    first: &Readings,
) -> impl Iterator<Item = &'static BinarySensorDescription> + '_ {
    BINARY_SENSORS.iter().filter(move |d| d.is_instantiated(first))
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog entry with empty key")]
    EmptyKey,

    #[error("duplicate catalog key '{0}'")]
    DuplicateKey(&'static str),

    #[error("'{0}' has a unit category with no unit in every unit system")]
    MissingUnit(&'static str),

    #[error("'{0}' has both a fixed unit and a unit category")]
    ConflictingUnit(&'static str),

    #[error("'{key}' icon pair '{icon_pair}' must be '<on>,<off>'")]
    InvalidIconPair {
        key: &'static str,
        icon_pair: &'static str,
    },
}

/// Check a pair of description tables
///
/// Keys must be non-empty and unique across both tables. A sensor either
/// has a fixed unit, a category every unit system can resolve, or neither.
/// Binary icon pairs must split into two non-empty icons.
pub fn validate(
    sensors: &'static [SensorDescription],
    binary_sensors: &'static [BinarySensorDescription],
) -> Result<(), CatalogError> {
    let mut seen = HashSet::new();
    let keys = sensors
        .iter()
        .map(|d| d.key)
        .chain(binary_sensors.iter().map(|d| d.key));
    for key in keys {
        if key.is_empty() {
            return Err(CatalogError::EmptyKey);
        }
        if !seen.insert(key) {
            return Err(CatalogError::DuplicateKey(key));
        }
    }

    let unit_tables: Vec<UnitDescriptions> = UnitSystem::ALL
        .iter()
        .map(|system| UnitDescriptions::for_system(*system))
        .collect();

    for description in sensors {
        match (description.native_unit, description.unit_category) {
            (Some(_), UnitCategory::None) | (None, UnitCategory::None) => {}
            (Some(_), _) => return Err(CatalogError::ConflictingUnit(description.key)),
            (None, category) => {
                if unit_tables.iter().any(|t| t.resolve(category).is_none()) {
                    return Err(CatalogError::MissingUnit(description.key));
                }
            }
        }
    }

    for description in binary_sensors {
        if description.icons().is_none() {
            return Err(CatalogError::InvalidIconPair {
                key: description.key,
                icon_pair: description.icon_pair,
            });
        }
    }

    Ok(())
}

/// Validate the shipped tables
pub fn validate_catalog() -> Result<(), CatalogError> {
    validate(SENSORS, BINARY_SENSORS)
}
