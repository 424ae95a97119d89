//! Meteobridge integration
//!
//! Polls a Meteobridge weather station and projects each snapshot onto a
//! fixed catalog of sensor and binary-sensor entities, all attached to one
//! registered device per bridge.
//!
//! # Key Types
//!
//! - [`DataUpdateCoordinator`] - Periodic poller holding the latest snapshot
//! - [`SensorProjection`] / [`BinarySensorProjection`] - Entity views over the snapshot
//! - [`DeviceIdentity`] - Stable identity of a physical bridge
//! - [`MeteobridgeIntegration`] - Per-entry setup and teardown
//!
//! The HTTP client lives outside this crate; anything implementing
//! [`DataSource`] can be plugged in through a [`SourceFactory`].

pub mod catalog;
pub mod config_flow;
pub mod constants;
pub mod coordinator;
pub mod device;
pub mod integration;
pub mod projection;
pub mod settings;
pub mod source;
pub mod units;

pub use catalog::{
    validate_catalog, BinarySensorDescription, CatalogError, SensorDescription, StateClass,
    BINARY_SENSORS, SENSORS,
};
pub use config_flow::{MeteobridgeConfigFlow, MeteobridgeOptionsFlow};
pub use constants::DOMAIN;
pub use coordinator::{CoordinatorUpdate, DataUpdateCoordinator};
pub use device::{bind, identity_key, BindError, DeviceIdentity};
pub use integration::{BridgeInstance, BridgeState, MeteobridgeIntegration, Projections};
pub use projection::{
    build_projections, BinarySensorProjection, EntityRecord, Projection, SensorProjection,
};
pub use settings::{BridgeSettings, SettingsError};
pub use source::{DataSource, DeviceInfo, SourceError, SourceFactory, SourceResult};
pub use units::{UnitCategory, UnitDescriptions, UnitSystem, UnknownUnitSystem};
