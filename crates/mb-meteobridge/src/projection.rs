//! Entity projections
//!
//! A projection exposes one catalog entry of one bridge as an entity. It
//! holds the bridge's coordinator and its `'static` description and reads
//! its value from the coordinator's current snapshot on every call, so
//! sibling projections always agree on which snapshot they show.

use std::collections::HashMap;
use std::sync::Arc;

use mb_core::{
    attributes, EntityId, EntityIdError, MeasurementValue, Platform, Readings, STATE_OFF,
    STATE_ON, STATE_UNAVAILABLE, STATE_UNKNOWN,
};
use mb_registries::EntityRegistration;
use serde::Serialize;
use serde_json::{json, Value};

use crate::catalog::{BinarySensorDescription, SensorDescription, StateClass};
use crate::constants::{DEFAULT_ATTRIBUTION, DOMAIN};
use crate::coordinator::DataUpdateCoordinator;
use crate::units::UnitDescriptions;

/// Everything published for one entity at one point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub unique_id: String,
    pub entity_id: EntityId,
    pub name: String,
    pub state: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_class: Option<StateClass>,
    pub attributes: HashMap<String, Value>,
}

/// Uniform view over sensor and binary sensor projections
pub trait Projection: Send + Sync {
    fn platform(&self) -> Platform;

    /// Catalog key
    fn key(&self) -> &'static str;

    /// Identity key of the bridge this projection belongs to
    fn identity(&self) -> &str;

    fn coordinator(&self) -> &DataUpdateCoordinator;

    fn entity_id(&self) -> &EntityId;

    /// Adopt the entity id the registry assigned
    fn set_entity_id(&mut self, entity_id: EntityId);

    fn name(&self) -> &'static str;

    fn state(&self) -> String;

    fn unit(&self) -> Option<&str> {
        None
    }

    fn icon(&self) -> Option<&str>;

    fn device_class(&self) -> Option<&'static str>;

    fn state_class(&self) -> Option<StateClass> {
        None
    }

    /// Attributes specific to this projection type
    fn extra_attributes(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// `<catalog key>_<identity key>`
    fn unique_id(&self) -> String {
        format!("{}_{}", self.key(), self.identity())
    }

    /// Availability follows the outcome of the latest refresh
    fn available(&self) -> bool {
        self.coordinator().last_update_success()
    }

    fn attributes(&self) -> HashMap<String, Value> {
        let mut attrs = self.extra_attributes();
        attrs.insert(attributes::ATTRIBUTION.to_string(), json!(DEFAULT_ATTRIBUTION));
        attrs.insert(attributes::FRIENDLY_NAME.to_string(), json!(self.name()));
        if let Some(data) = self.coordinator().data() {
            attrs.insert(
                attributes::UPDATED.to_string(),
                json!(data.timestamp().to_rfc3339()),
            );
        }
        if let Some(unit) = self.unit() {
            attrs.insert(attributes::UNIT_OF_MEASUREMENT.to_string(), json!(unit));
        }
        if let Some(icon) = self.icon() {
            attrs.insert(attributes::ICON.to_string(), json!(icon));
        }
        if let Some(device_class) = self.device_class() {
            attrs.insert(attributes::DEVICE_CLASS.to_string(), json!(device_class));
        }
        if let Some(state_class) = self.state_class() {
            attrs.insert(attributes::STATE_CLASS.to_string(), json!(state_class.as_str()));
        }
        attrs
    }

    fn record(&self) -> EntityRecord {
        EntityRecord {
            unique_id: self.unique_id(),
            entity_id: self.entity_id().clone(),
            name: self.name().to_string(),
            state: self.state(),
            available: self.available(),
            unit: self.unit().map(str::to_string),
            icon: self.icon().map(str::to_string),
            device_class: self.device_class().map(str::to_string),
            state_class: self.state_class(),
            attributes: self.attributes(),
        }
    }

    /// Entity registry entry for this projection
    fn registration(&self, device_id: &str, config_entry_id: &str) -> EntityRegistration {
        EntityRegistration {
            suggested_entity_id: self.entity_id().clone(),
            unique_id: self.unique_id(),
            platform: DOMAIN.to_string(),
            device_id: Some(device_id.to_string()),
            config_entry_id: Some(config_entry_id.to_string()),
            original_name: Some(self.name().to_string()),
            original_icon: self.icon().map(str::to_string),
            original_device_class: self.device_class().map(str::to_string),
            unit_of_measurement: self.unit().map(str::to_string),
        }
    }
}

fn suggested_entity_id(platform: Platform, key: &str) -> Result<EntityId, EntityIdError> {
    EntityId::from_name(platform, &format!("{}_{}", DOMAIN, key))
}

/// Value of `key` in the current snapshot
fn current_value(coordinator: &DataUpdateCoordinator, key: &str) -> Option<MeasurementValue> {
    coordinator
        .data()
        .and_then(|data: Arc<Readings>| data.get(key).cloned())
}

/// Numeric or textual measurement
pub struct SensorProjection {
    coordinator: Arc<DataUpdateCoordinator>,
    description: &'static SensorDescription,
    identity: String,
    entity_id: EntityId,
    /// Resolved once; unit choices only change through a reload
    unit: Option<String>,
}

impl SensorProjection {
    pub fn new(
        coordinator: Arc<DataUpdateCoordinator>,
        description: &'static SensorDescription,
        identity: impl Into<String>,
        units: &UnitDescriptions,
    ) -> Result<Self, EntityIdError> {
        let unit = description
            .native_unit
            .or_else(|| units.resolve(description.unit_category))
            .map(str::to_string);

        Ok(Self {
            entity_id: suggested_entity_id(Platform::Sensor, description.key)?,
            coordinator,
            description,
            identity: identity.into(),
            unit,
        })
    }

    pub fn description(&self) -> &'static SensorDescription {
        self.description
    }

    /// `None` before the first successful refresh or when the key is absent
    pub fn value_of(&self) -> Option<MeasurementValue> {
        current_value(&self.coordinator, self.description.key)
    }
}

impl Projection for SensorProjection {
    fn platform(&self) -> Platform {
        Platform::Sensor
    }

    fn key(&self) -> &'static str {
        self.description.key
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn coordinator(&self) -> &DataUpdateCoordinator {
        &self.coordinator
    }

    fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    fn set_entity_id(&mut self, entity_id: EntityId) {
        self.entity_id = entity_id;
    }

    fn name(&self) -> &'static str {
        self.description.name
    }

    fn state(&self) -> String {
        if !self.available() {
            return STATE_UNAVAILABLE.to_string();
        }
        self.value_of()
            .map(|v| v.render())
            .unwrap_or_else(|| STATE_UNKNOWN.to_string())
    }

    fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    fn icon(&self) -> Option<&str> {
        self.description.icon
    }

    fn device_class(&self) -> Option<&'static str> {
        self.description.device_class
    }

    fn state_class(&self) -> Option<StateClass> {
        self.description.state_class
    }

    fn extra_attributes(&self) -> HashMap<String, Value> {
        let Some(companion) = self.description.companion else {
            return HashMap::new();
        };
        current_value(&self.coordinator, companion)
            .map(|v| HashMap::from([(companion.to_string(), v.to_json())]))
            .unwrap_or_default()
    }
}

/// On/off measurement
pub struct BinarySensorProjection {
    coordinator: Arc<DataUpdateCoordinator>,
    description: &'static BinarySensorDescription,
    identity: String,
    entity_id: EntityId,
}

impl BinarySensorProjection {
    pub fn new(
        coordinator: Arc<DataUpdateCoordinator>,
        description: &'static BinarySensorDescription,
        identity: impl Into<String>,
    ) -> Result<Self, EntityIdError> {
        Ok(Self {
            entity_id: suggested_entity_id(Platform::BinarySensor, description.key)?,
            coordinator,
            description,
            identity: identity.into(),
        })
    }

    pub fn description(&self) -> &'static BinarySensorDescription {
        self.description
    }

    /// True iff the bound field is present and truthy
    pub fn is_active(&self) -> bool {
        current_value(&self.coordinator, self.description.key)
            .map(|v| v.is_truthy())
            .unwrap_or(false)
    }
}

impl Projection for BinarySensorProjection {
    fn platform(&self) -> Platform {
        Platform::BinarySensor
    }

    fn key(&self) -> &'static str {
        self.description.key
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn coordinator(&self) -> &DataUpdateCoordinator {
        &self.coordinator
    }

    fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    fn set_entity_id(&mut self, entity_id: EntityId) {
        self.entity_id = entity_id;
    }

    fn name(&self) -> &'static str {
        self.description.name
    }

    fn state(&self) -> String {
        if !self.available() {
            return STATE_UNAVAILABLE.to_string();
        }
        match current_value(&self.coordinator, self.description.key) {
            None => STATE_UNKNOWN.to_string(),
            Some(v) if v.is_truthy() => STATE_ON.to_string(),
            Some(_) => STATE_OFF.to_string(),
        }
    }

    /// Active icon when on, inactive icon otherwise
    fn icon(&self) -> Option<&str> {
        let (on, off) = self.description.icons()?;
        Some(if self.is_active() { on } else { off })
    }

    fn device_class(&self) -> Option<&'static str> {
        self.description.device_class
    }
}

/// Projections for every catalog entry instantiated by `first`
pub fn build_projections(
    coordinator: &Arc<DataUpdateCoordinator>,
    first: &Readings,
    identity: &str,
    units: &UnitDescriptions,
) -> Result<Vec<Box<dyn Projection>>, EntityIdError> {
    let mut projections: Vec<Box<dyn Projection>> = Vec::new();

    for description in crate::catalog::sensors_for(first) {
        projections.push(Box::new(SensorProjection::new(
            Arc::clone(coordinator),
            description,
            identity,
            units,
        )?));
    }
    for description in crate::catalog::binary_sensors_for(first) {
        projections.push(Box::new(BinarySensorProjection::new(
            Arc::clone(coordinator),
            description,
            identity,
        )?));
    }

    Ok(projections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{binary_sensor, sensor};
    use crate::source::{DataSource, DeviceInfo, SourceError, SourceResult};
    use crate::units::UnitSystem;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    struct QueueSource(Mutex<VecDeque<SourceResult<Readings>>>);

    #[async_trait]
    impl DataSource for QueueSource {
        async fn fetch_device_info(&self) -> SourceResult<DeviceInfo> {
            Ok(DeviceInfo::default())
        }

        async fn fetch_snapshot(&self) -> SourceResult<Readings> {
            self.0
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SourceError::Transient("exhausted".to_string())))
        }

        fn unit_descriptions(&self) -> UnitDescriptions {
            UnitDescriptions::default()
        }
    }

    fn coordinator(script: Vec<SourceResult<Readings>>) -> Arc<DataUpdateCoordinator> {
        DataUpdateCoordinator::new(
            "test",
            Arc::new(QueueSource(Mutex::new(script.into()))),
            Duration::from_secs(10),
        )
    }

    fn first_snapshot() -> Readings {
        Readings::new(Utc::now())
            .with("air_temperature", 21.5)
            .with("relative_humidity", 60.0)
            .with("is_raining", false)
    }

    #[tokio::test]
    async fn test_sensor_reads_current_snapshot() {
        let coordinator = coordinator(vec![Ok(first_snapshot())]);
        let projection = SensorProjection::new(
            coordinator.clone(),
            sensor("air_temperature").unwrap(),
            "aa:bb:cc:dd:ee:ff",
            &UnitDescriptions::default(),
        )
        .unwrap();

        assert_eq!(projection.value_of(), None);
        assert_eq!(projection.state(), STATE_UNAVAILABLE);

        coordinator.refresh().await.unwrap();
        assert_eq!(projection.value_of(), Some(MeasurementValue::Number(21.5)));
        assert_eq!(projection.state(), "21.5");
        assert_eq!(projection.unit(), Some("°C"));
        assert_eq!(projection.unique_id(), "air_temperature_aa:bb:cc:dd:ee:ff");
        assert_eq!(
            projection.entity_id().to_string(),
            "sensor.meteobridge_air_temperature"
        );
    }

    #[tokio::test]
    async fn test_binary_sensor_icons_follow_state() {
        let coordinator = coordinator(vec![
            Ok(first_snapshot()),
            Ok(Readings::new(Utc::now()).with("is_raining", true)),
        ]);
        let projection = BinarySensorProjection::new(
            coordinator.clone(),
            binary_sensor("is_raining").unwrap(),
            "id",
        )
        .unwrap();

        coordinator.refresh().await.unwrap();
        assert!(!projection.is_active());
        assert_eq!(projection.state(), STATE_OFF);
        assert_eq!(projection.icon(), Some("mdi:water-off"));

        coordinator.refresh().await.unwrap();
        assert!(projection.is_active());
        assert_eq!(projection.state(), STATE_ON);
        assert_eq!(projection.icon(), Some("mdi:water"));
    }

    #[tokio::test]
    async fn test_unit_resolved_from_category() {
        let coordinator = coordinator(vec![]);
        let wind = sensor("wind_avg").unwrap();

        let metric = SensorProjection::new(
            coordinator.clone(),
            wind,
            "id",
            &UnitDescriptions::for_system(UnitSystem::Metric),
        )
        .unwrap();
        let imperial = SensorProjection::new(
            coordinator,
            wind,
            "id",
            &UnitDescriptions::for_system(UnitSystem::Imperial),
        )
        .unwrap();

        assert_eq!(metric.unit(), Some("m/s"));
        assert_eq!(imperial.unit(), Some("mph"));
    }

    #[tokio::test]
    async fn test_imperial_temperature_in_fahrenheit() {
        let coordinator = coordinator(vec![Ok(Readings::new(Utc::now())
            .with("air_temperature", 70.7)
            .with("dew_point", 55.4))]);
        coordinator.refresh().await.unwrap();
        let units = UnitDescriptions::for_system(UnitSystem::Imperial);

        let air = SensorProjection::new(
            coordinator.clone(),
            sensor("air_temperature").unwrap(),
            "id",
            &units,
        )
        .unwrap();
        let dew_point =
            SensorProjection::new(coordinator, sensor("dew_point").unwrap(), "id", &units).unwrap();

        assert_eq!(air.state(), "70.7");
        assert_eq!(air.unit(), Some("°F"));
        assert_eq!(dew_point.unit(), Some("°F"));
        assert_eq!(
            air.attributes().get("unit_of_measurement"),
            Some(&serde_json::json!("°F"))
        );
    }

    #[tokio::test]
    async fn test_companion_attribute() {
        let coordinator = coordinator(vec![Ok(Readings::new(Utc::now())
            .with("air_temperature_dmax", 25.1)
            .with("air_temperature_dmaxtime", "14:32"))]);
        coordinator.refresh().await.unwrap();

        let projection = SensorProjection::new(
            coordinator,
            sensor("air_temperature_dmax").unwrap(),
            "id",
            &UnitDescriptions::default(),
        )
        .unwrap();

        let attrs = projection.attributes();
        assert_eq!(attrs["air_temperature_dmaxtime"], json!("14:32"));
        assert_eq!(attrs[attributes::ATTRIBUTION], json!(DEFAULT_ATTRIBUTION));
        assert_eq!(attrs[attributes::STATE_CLASS], json!("measurement"));
        assert!(attrs.contains_key(attributes::UPDATED));
    }

    #[tokio::test]
    async fn test_absent_key_is_unknown() {
        let coordinator = coordinator(vec![Ok(first_snapshot())]);
        coordinator.refresh().await.unwrap();

        let lowbat = BinarySensorProjection::new(
            coordinator.clone(),
            binary_sensor("is_lowbat").unwrap(),
            "id",
        )
        .unwrap();
        let visibility = SensorProjection::new(
            coordinator,
            sensor("visibility").unwrap(),
            "id",
            &UnitDescriptions::default(),
        )
        .unwrap();

        assert!(!lowbat.is_active());
        assert_eq!(lowbat.state(), STATE_UNKNOWN);
        assert_eq!(visibility.value_of(), None);
        assert_eq!(visibility.state(), STATE_UNKNOWN);
    }

    #[tokio::test]
    async fn test_build_projections_follows_first_snapshot() {
        let coordinator = coordinator(vec![]);
        let first = first_snapshot();
        let projections =
            build_projections(&coordinator, &first, "id", &UnitDescriptions::default()).unwrap();

        let keys: Vec<&str> = projections.iter().map(|p| p.key()).collect();
        assert_eq!(keys, vec!["air_temperature", "relative_humidity", "is_raining"]);
    }

    #[tokio::test]
    async fn test_registration_carries_metadata() {
        let coordinator = coordinator(vec![]);
        let projection = SensorProjection::new(
            coordinator,
            sensor("sealevel_pressure").unwrap(),
            "id",
            &UnitDescriptions::for_system(UnitSystem::Imperial),
        )
        .unwrap();

        let registration = projection.registration("device1", "entry1");
        assert_eq!(registration.unique_id, "sealevel_pressure_id");
        assert_eq!(registration.platform, DOMAIN);
        assert_eq!(registration.unit_of_measurement.as_deref(), Some("inHg"));
        assert_eq!(registration.original_device_class.as_deref(), Some("pressure"));
    }
}
