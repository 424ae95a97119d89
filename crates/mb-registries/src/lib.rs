//! Meteobridge Registries
//!
//! Persistent registries for tracking:
//! - Devices (DeviceRegistry), one per physical bridge
//! - Entities (EntityRegistry), one per published projection
//!
//! Both registries use JSON persistence in the `.storage/` directory
//! with versioning for migrations.

pub mod storage;

pub mod device_registry;
pub mod entity_registry;

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

pub use device_registry::{
    format_mac, DeviceConnection, DeviceEntry, DeviceIdentifier, DeviceRegistration,
    DeviceRegistry, DeviceRegistryData, CONNECTION_NETWORK_MAC,
};

pub use entity_registry::{EntityEntry, EntityRegistration, EntityRegistry, EntityRegistryData};

use std::sync::Arc;

/// Device and entity registries sharing one storage directory
pub struct Registries {
    pub storage: Arc<Storage>,
    pub devices: DeviceRegistry,
    pub entities: EntityRegistry,
}

impl Registries {
    pub fn new(config_dir: impl AsRef<std::path::Path>) -> Self {
        let storage = Arc::new(Storage::new(config_dir));

        Self {
            devices: DeviceRegistry::new(storage.clone()),
            entities: EntityRegistry::new(storage.clone()),
            storage,
        }
    }

    pub async fn load_all(&self) -> StorageResult<()> {
        self.devices.load().await?;
        self.entities.load().await?;
        Ok(())
    }

    pub async fn save_all(&self) -> StorageResult<()> {
        self.devices.save().await?;
        self.entities.save().await?;
        Ok(())
    }

    /// Drop everything a config entry registered
    pub fn clear_config_entry(&self, config_entry_id: &str) {
        self.entities.clear_config_entry(config_entry_id);
        self.devices.clear_config_entry(config_entry_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_core::{EntityId, Platform};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registries_round_trip_through_storage() {
        let temp_dir = TempDir::new().unwrap();

        {
            let registries = Registries::new(temp_dir.path());
            let device = registries.devices.get_or_create(
                "entry1",
                &DeviceRegistration {
                    identifiers: vec![DeviceIdentifier::new("meteobridge", "aa:bb:cc:dd:ee:ff")],
                    name: Some("Pro (10.0.0.5)".to_string()),
                    ..Default::default()
                },
            );
            registries.entities.get_or_create(&EntityRegistration {
                suggested_entity_id: EntityId::new(Platform::BinarySensor, "meteobridge_is_raining")
                    .unwrap(),
                unique_id: "is_raining_aa:bb:cc:dd:ee:ff".to_string(),
                platform: "meteobridge".to_string(),
                device_id: Some(device.id.clone()),
                config_entry_id: Some("entry1".to_string()),
                original_name: Some("Is Raining".to_string()),
                original_icon: None,
                original_device_class: None,
                unit_of_measurement: None,
            });
            registries.save_all().await.unwrap();
        }

        let registries = Registries::new(temp_dir.path());
        registries.load_all().await.unwrap();
        assert_eq!(registries.devices.len(), 1);
        assert_eq!(registries.entities.len(), 1);

        registries.clear_config_entry("entry1");
        assert!(registries.devices.is_empty());
        assert!(registries.entities.is_empty());
    }
}
