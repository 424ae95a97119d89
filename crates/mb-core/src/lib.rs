//! Core types for the Meteobridge bridge
//!
//! This crate provides the fundamental types shared by every other crate in
//! the workspace: entity ids, published entity states, and the measurement
//! snapshot fetched from a bridge.

mod entity_id;
mod readings;
mod state;

pub use entity_id::{slugify, EntityId, EntityIdError, Platform};
pub use readings::{MeasurementValue, Readings, TIME_KEY};
pub use state::State;

/// State value published when an entity cannot currently be read
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value published when an entity is readable but has no value
pub const STATE_UNKNOWN: &str = "unknown";

/// Binary state values
pub const STATE_ON: &str = "on";
pub const STATE_OFF: &str = "off";

/// Maximum length for a state value
pub const MAX_STATE_LENGTH: usize = 255;

/// Attribute names shared by published states
pub mod attributes {
    pub const ATTRIBUTION: &str = "attribution";
    pub const DEVICE_CLASS: &str = "device_class";
    pub const FRIENDLY_NAME: &str = "friendly_name";
    pub const ICON: &str = "icon";
    pub const STATE_CLASS: &str = "state_class";
    pub const UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
    pub const UPDATED: &str = "updated";
}
