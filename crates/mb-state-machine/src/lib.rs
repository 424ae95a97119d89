//! Published entity states
//!
//! The StateMachine holds the latest rendered state of every entity the
//! bridge integrations publish, indexed by platform, and broadcasts a
//! [`StateChanged`] notification on every write or removal.

use std::collections::HashMap;

use dashmap::DashMap;
use mb_core::{EntityId, Platform, State};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, instrument, trace};

/// Default channel capacity for change subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Notification sent for every state write or removal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChanged {
    pub entity_id: EntityId,
    pub old_state: Option<State>,
    pub new_state: Option<State>,
}

impl StateChanged {
    /// True when the rendered value differs between old and new
    pub fn value_changed(&self) -> bool {
        self.old_state.as_ref().map(|s| &s.state) != self.new_state.as_ref().map(|s| &s.state)
    }
}

/// Store of the current state of all published entities
pub struct StateMachine {
    /// All entity states keyed by entity_id string
    states: DashMap<String, State>,
    /// Index of entity_ids by platform
    platform_index: DashMap<Platform, Vec<String>>,
    changes: broadcast::Sender<StateChanged>,
}

impl StateMachine {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            states: DashMap::new(),
            platform_index: DashMap::new(),
            changes,
        }
    }

    /// Subscribe to state change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.changes.subscribe()
    }

    /// Set the state of an entity
    ///
    /// `last_changed` only moves when the rendered value changes.
    #[instrument(skip(self, state, attributes), fields(entity_id = %entity_id))]
    pub fn set(
        &self,
        entity_id: EntityId,
        state: impl Into<String>,
        attributes: HashMap<String, serde_json::Value>,
    ) -> State {
        let key = entity_id.to_string();
        let old_state = self.states.get(&key).map(|s| s.clone());

        let new_state = match &old_state {
            Some(existing) => existing.with_update(state, attributes),
            None => State::new(entity_id.clone(), state, attributes),
        };

        debug!(
            state = %new_state.state,
            changed = old_state.as_ref().map(|s| s.state != new_state.state).unwrap_or(true),
            "Setting entity state"
        );

        self.states.insert(key.clone(), new_state.clone());

        if old_state.is_none() {
            self.platform_index
                .entry(entity_id.platform())
                .or_default()
                .push(key);
        }

        // No receivers is fine
        let _ = self.changes.send(StateChanged {
            entity_id,
            old_state,
            new_state: Some(new_state.clone()),
        });

        new_state
    }

    pub fn get(&self, entity_id: &str) -> Option<State> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    pub fn get_state(&self, entity_id: &str) -> Option<String> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    pub fn entity_ids(&self, platform: Platform) -> Vec<String> {
        self.platform_index
            .get(&platform)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Remove an entity's state, notifying with `new_state: None`
    #[instrument(skip(self), fields(entity_id = %entity_id))]
    pub fn remove(&self, entity_id: &EntityId) -> Option<State> {
        let key = entity_id.to_string();
        let old_state = self.states.remove(&key).map(|(_, s)| s);

        if let Some(ref state) = old_state {
            trace!("Removing entity state");

            if let Some(mut ids) = self.platform_index.get_mut(&entity_id.platform()) {
                ids.retain(|id| id != &key);
            }

            let _ = self.changes.send(StateChanged {
                entity_id: entity_id.clone(),
                old_state: Some(state.clone()),
                new_state: None,
            });
        }

        old_state
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sensor(object_id: &str) -> EntityId {
        EntityId::new(Platform::Sensor, object_id).unwrap()
    }

    fn binary(object_id: &str) -> EntityId {
        EntityId::new(Platform::BinarySensor, object_id).unwrap()
    }

    #[test]
    fn test_set_and_get_state() {
        let sm = StateMachine::new();
        let attrs = HashMap::from([("unit_of_measurement".to_string(), json!("°C"))]);

        let state = sm.set(sensor("meteobridge_air_temperature"), "21.5", attrs.clone());

        assert_eq!(state.state, "21.5");
        assert_eq!(state.attributes, attrs);
        assert_eq!(
            sm.get_state("sensor.meteobridge_air_temperature").as_deref(),
            Some("21.5")
        );
        assert!(sm.get_state("sensor.meteobridge_missing").is_none());
    }

    #[test]
    fn test_platform_indexing() {
        let sm = StateMachine::new();

        sm.set(sensor("meteobridge_air_temperature"), "21.5", HashMap::new());
        sm.set(sensor("meteobridge_relative_humidity"), "60", HashMap::new());
        sm.set(binary("meteobridge_is_raining"), "off", HashMap::new());
        // Rewrite must not duplicate the index entry
        sm.set(sensor("meteobridge_air_temperature"), "21.6", HashMap::new());

        assert_eq!(sm.entity_ids(Platform::Sensor).len(), 2);
        assert_eq!(
            sm.entity_ids(Platform::BinarySensor),
            vec!["binary_sensor.meteobridge_is_raining".to_string()]
        );
        assert_eq!(sm.entity_count(), 3);
    }

    #[test]
    fn test_remove_state() {
        let sm = StateMachine::new();
        let id = binary("meteobridge_freezing");
        sm.set(id.clone(), "on", HashMap::new());

        let removed = sm.remove(&id).unwrap();
        assert_eq!(removed.state, "on");
        assert!(sm.get("binary_sensor.meteobridge_freezing").is_none());
        assert!(sm.entity_ids(Platform::BinarySensor).is_empty());
        assert!(sm.remove(&id).is_none());
    }

    #[tokio::test]
    async fn test_change_notification() {
        let sm = StateMachine::new();
        let mut rx = sm.subscribe();

        sm.set(sensor("meteobridge_wind_gust"), "4.2", HashMap::new());
        sm.set(sensor("meteobridge_wind_gust"), "4.2", HashMap::new());

        let first = rx.recv().await.unwrap();
        assert!(first.old_state.is_none());
        assert!(first.value_changed());

        let second = rx.recv().await.unwrap();
        assert!(!second.value_changed());
        assert_eq!(second.new_state.unwrap().state, "4.2");
    }
}
