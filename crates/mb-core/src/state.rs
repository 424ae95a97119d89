//! Published state of a single entity

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, MAX_STATE_LENGTH, STATE_UNKNOWN};

/// The state of an entity at a point in time
///
/// The value is always rendered as a string (e.g. "21.5", "on",
/// "unavailable"); typed metadata travels in the attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub entity_id: EntityId,

    /// Rendered state value
    pub state: String,

    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the state was last written, even if the value is unchanged
    pub last_updated: DateTime<Utc>,
}

impl State {
    pub fn new(
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: clamp_state(state.into()),
            attributes,
            last_changed: now,
            last_updated: now,
        }
    }

    /// Create the successor of this state, keeping `last_changed` when the
    /// value did not change
    pub fn with_update(
        &self,
        new_state: impl Into<String>,
        new_attributes: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        let new_state = clamp_state(new_state.into());
        let state_changed = self.state != new_state;

        Self {
            entity_id: self.entity_id.clone(),
            state: new_state,
            attributes: new_attributes,
            last_changed: if state_changed {
                now
            } else {
                self.last_changed
            },
            last_updated: now,
        }
    }

    /// Get an attribute value by key
    pub fn attribute<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.attributes
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn clamp_state(state: String) -> String {
    if state.len() > MAX_STATE_LENGTH {
        STATE_UNKNOWN.to_string()
    } else {
        state
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Platform;
    use serde_json::json;

    fn temperature_id() -> EntityId {
        EntityId::new(Platform::Sensor, "meteobridge_air_temperature").unwrap()
    }

    #[test]
    fn test_update_keeps_last_changed_for_same_value() {
        let first = State::new(temperature_id(), "21.5", HashMap::new());
        let second = first.with_update("21.5", HashMap::new());

        assert_eq!(second.last_changed, first.last_changed);
        assert!(second.last_updated >= first.last_updated);
    }

    #[test]
    fn test_update_moves_last_changed_for_new_value() {
        let first = State::new(temperature_id(), "21.5", HashMap::new());
        let second = first.with_update("unavailable", HashMap::new());

        assert_eq!(second.state, crate::STATE_UNAVAILABLE);
        assert!(second.last_changed >= first.last_changed);
    }

    #[test]
    fn test_overlong_state_is_unknown() {
        let state = State::new(temperature_id(), "x".repeat(MAX_STATE_LENGTH + 1), HashMap::new());
        assert_eq!(state.state, STATE_UNKNOWN);
    }

    #[test]
    fn test_attribute_lookup() {
        let attrs = HashMap::from([("unit_of_measurement".to_string(), json!("°C"))]);
        let state = State::new(temperature_id(), "21.5", attrs);

        assert_eq!(
            state.attribute::<String>("unit_of_measurement").as_deref(),
            Some("°C")
        );
        assert_eq!(state.attribute::<String>("icon"), None);
    }
}
