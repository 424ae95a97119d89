//! Device Registry
//!
//! One record per physical bridge, indexed by identifier, connection and
//! owning config entry.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

pub const STORAGE_KEY: &str = "meteobridge.device_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Connection type for MAC addresses
pub const CONNECTION_NETWORK_MAC: &str = "mac";

/// A device identifier `(domain, id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A device connection `(type, id)`, MAC addresses normalised on creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConnection(pub String, pub String);

impl DeviceConnection {
    pub fn new(conn_type: impl Into<String>, id: impl Into<String>) -> Self {
        let conn_type = conn_type.into();
        let id = id.into();
        let id = if conn_type == CONNECTION_NETWORK_MAC {
            format_mac(&id)
        } else {
            id
        };
        Self(conn_type, id)
    }

    pub fn mac(mac: &str) -> Self {
        Self::new(CONNECTION_NETWORK_MAC, mac)
    }

    pub fn connection_type(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// Normalise a MAC address to lowercase colon-separated form
///
/// Accepts `AA:BB:..`, `AA-BB-..`, `aabb.ccdd.eeff` and bare 12-digit hex.
/// Anything else is returned unchanged.
pub fn format_mac(mac: &str) -> String {
    let separators = |sep: char| mac.chars().filter(|c| *c == sep).count();

    if mac.len() == 17 && separators(':') == 5 {
        return mac.to_lowercase();
    }

    let bare = if mac.len() == 17 && separators('-') == 5 {
        mac.replace('-', "")
    } else if mac.len() == 14 && separators('.') == 2 {
        mac.replace('.', "")
    } else if mac.len() == 12 {
        mac.to_string()
    } else {
        return mac.to_string();
    };

    if !bare.chars().all(|c| c.is_ascii_hexdigit()) {
        return mac.to_string();
    }

    let lower = bare.to_lowercase();
    (0..lower.len())
        .step_by(2)
        .map(|i| &lower[i..i + 2])
        .collect::<Vec<_>>()
        .join(":")
}

/// A registered device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal UUID
    pub id: String,

    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    #[serde(default)]
    pub connections: Vec<DeviceConnection>,

    /// Config entries that own this device
    #[serde(default)]
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Firmware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    fn new(registration: &DeviceRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: registration.identifiers.clone(),
            connections: registration.connections.clone(),
            config_entries: Vec::new(),
            name: registration.name.clone(),
            manufacturer: registration.manufacturer.clone(),
            model: registration.model.clone(),
            sw_version: registration.sw_version.clone(),
            configuration_url: registration.configuration_url.clone(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// What an integration knows about a device when registering it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceRegistration {
    pub identifiers: Vec<DeviceIdentifier>,
    pub connections: Vec<DeviceConnection>,
    pub name: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub sw_version: Option<String>,
    pub configuration_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Device registry with identifier, connection and config-entry indexes
///
/// Entries are stored as `Arc<DeviceEntry>` to avoid cloning on reads.
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    /// Primary index: device_id -> DeviceEntry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// identifier key -> device_id
    by_identifier: DashMap<String, String>,

    /// connection key -> device_id
    by_connection: DashMap<String, String>,

    /// config_entry_id -> device_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_connection: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    pub async fn load(&self) -> StorageResult<()> {
        if let Some(data) = self.storage.load::<DeviceRegistryData>().await? {
            info!("Loading {} devices from storage", data.devices.len());
            for entry in data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> =
            self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        devices.sort_by_key(|d| d.created_at);

        self.storage.save(&DeviceRegistryData { devices }).await?;
        debug!("Saved {} devices to storage", self.by_id.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();

        for identifier in &entry.identifiers {
            self.by_identifier.insert(identifier.key(), device_id.clone());
        }
        for connection in &entry.connections {
            self.by_connection.insert(connection.key(), device_id.clone());
        }
        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }

        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for connection in &entry.connections {
            self.by_connection.remove(&connection.key());
        }
        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }
        self.by_id.remove(&entry.id);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = DeviceIdentifier::new(domain, id).key();
        self.by_identifier
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    pub fn get_by_connection(&self, conn_type: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = DeviceConnection::new(conn_type, id).key();
        self.by_connection
            .get(&key)
            .and_then(|device_id| self.get(&device_id))
    }

    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        self.by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Find a device by any identifier, then by any connection
    pub fn find(&self, registration: &DeviceRegistration) -> Option<Arc<DeviceEntry>> {
        registration
            .identifiers
            .iter()
            .find_map(|ident| self.get_by_identifier(ident.domain(), ident.id()))
            .or_else(|| {
                registration
                    .connections
                    .iter()
                    .find_map(|conn| self.get_by_connection(conn.connection_type(), conn.id()))
            })
    }

    /// Get or create the device described by `registration`
    ///
    /// An existing device gains the config entry and any new identifiers or
    /// connections; its descriptive fields are refreshed from the registration.
    pub fn get_or_create(
        &self,
        config_entry_id: &str,
        registration: &DeviceRegistration,
    ) -> Arc<DeviceEntry> {
        if let Some(existing) = self.find(registration) {
            debug!("Found existing device: {}", existing.id);
            let ce_id = config_entry_id.to_string();
            return self
                .update(&existing.id, |e| {
                    if !e.config_entries.contains(&ce_id) {
                        e.config_entries.push(ce_id);
                    }
                    for ident in &registration.identifiers {
                        if !e.identifiers.contains(ident) {
                            e.identifiers.push(ident.clone());
                        }
                    }
                    for conn in &registration.connections {
                        if !e.connections.contains(conn) {
                            e.connections.push(conn.clone());
                        }
                    }
                    merge_field(&mut e.name, &registration.name);
                    merge_field(&mut e.manufacturer, &registration.manufacturer);
                    merge_field(&mut e.model, &registration.model);
                    merge_field(&mut e.sw_version, &registration.sw_version);
                    merge_field(&mut e.configuration_url, &registration.configuration_url);
                })
                .unwrap_or(existing);
        }

        let mut entry = DeviceEntry::new(registration);
        entry.config_entries.push(config_entry_id.to_string());

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));

        info!("Registered new device: {:?} ({})", entry.name, entry.id);
        entry
    }

    /// Apply `f` to a device, re-indexing it afterwards
    pub fn update<F>(&self, device_id: &str, f: F) -> Option<Arc<DeviceEntry>>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let current = self.get(device_id)?;
        self.unindex_entry(&current);

        let mut entry = (*current).clone();
        let before = serde_json::to_value(&entry).ok();
        f(&mut entry);
        if serde_json::to_value(&entry).ok() != before {
            entry.modified_at = Utc::now();
        }

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Some(entry)
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.get(device_id)?;
        self.unindex_entry(&entry);
        info!("Removed device: {}", device_id);
        Some(entry)
    }

    /// Detach a config entry from its devices
    ///
    /// Devices left without any config entry are removed. Returns the ids of
    /// removed devices.
    pub fn clear_config_entry(&self, config_entry_id: &str) -> Vec<String> {
        let device_ids: Vec<String> = self
            .get_by_config_entry_id(config_entry_id)
            .iter()
            .map(|d| d.id.clone())
            .collect();

        let mut removed = Vec::new();
        for device_id in device_ids {
            let Some(entry) = self.get(&device_id) else {
                continue;
            };

            if entry.config_entries.len() <= 1 {
                self.remove(&device_id);
                removed.push(device_id);
            } else {
                self.update(&device_id, |e| {
                    e.config_entries.retain(|id| id != config_entry_id);
                });
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Arc<DeviceEntry>> + '_ {
        self.by_id.iter().map(|r| Arc::clone(r.value()))
    }
}

fn merge_field(target: &mut Option<String>, source: &Option<String>) {
    if source.is_some() {
        target.clone_from(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, DeviceRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        (temp_dir, DeviceRegistry::new(storage))
    }

    fn bridge(mac: &str, firmware: &str) -> DeviceRegistration {
        DeviceRegistration {
            identifiers: vec![DeviceIdentifier::new("meteobridge", format_mac(mac))],
            connections: vec![DeviceConnection::mac(mac)],
            name: Some("NanoSD (192.168.1.20)".to_string()),
            manufacturer: Some("Meteobridge".to_string()),
            model: Some("NanoSD".to_string()),
            sw_version: Some(firmware.to_string()),
            configuration_url: Some("http://192.168.1.20".to_string()),
        }
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac("AA:BB:CC:DD:EE:FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AA-BB-CC-DD-EE-FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("aabb.ccdd.eeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AABBCCDDEEFF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("not-a-mac"), "not-a-mac");
        assert_eq!(format_mac("zzbbccddeeff"), "zzbbccddeeff");
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (_dir, registry) = registry();

        let first = registry.get_or_create("entry1", &bridge("AA:BB:CC:DD:EE:FF", "5.7"));
        let second = registry.get_or_create("entry1", &bridge("aabbccddeeff", "5.8"));

        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(second.sw_version.as_deref(), Some("5.8"));
        assert_eq!(second.config_entries, vec!["entry1".to_string()]);
    }

    #[test]
    fn test_lookup_indexes() {
        let (_dir, registry) = registry();
        let device = registry.get_or_create("entry1", &bridge("AA:BB:CC:DD:EE:FF", "5.7"));

        assert_eq!(
            registry
                .get_by_identifier("meteobridge", "aa:bb:cc:dd:ee:ff")
                .map(|d| d.id.clone()),
            Some(device.id.clone())
        );
        assert!(registry
            .get_by_connection(CONNECTION_NETWORK_MAC, "AA-BB-CC-DD-EE-FF")
            .is_some());
        assert_eq!(registry.get_by_config_entry_id("entry1").len(), 1);
        assert_eq!(
            device.identifiers,
            vec![DeviceIdentifier::new("meteobridge", "aa:bb:cc:dd:ee:ff")]
        );
    }

    #[test]
    fn test_clear_config_entry_removes_orphans() {
        let (_dir, registry) = registry();
        let shared = registry.get_or_create("entry1", &bridge("AA:BB:CC:DD:EE:01", "5.7"));
        registry.get_or_create("entry2", &bridge("AA:BB:CC:DD:EE:01", "5.7"));
        registry.get_or_create("entry1", &bridge("AA:BB:CC:DD:EE:02", "5.7"));

        let removed = registry.clear_config_entry("entry1");

        assert_eq!(removed.len(), 1);
        assert_eq!(registry.len(), 1);
        let kept = registry.get(&shared.id).unwrap();
        assert_eq!(kept.config_entries, vec!["entry2".to_string()]);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        let device_id = {
            let registry = DeviceRegistry::new(storage.clone());
            let device = registry.get_or_create("entry1", &bridge("AA:BB:CC:DD:EE:FF", "5.7"));
            registry.save().await.unwrap();
            device.id.clone()
        };

        let registry = DeviceRegistry::new(storage);
        registry.load().await.unwrap();

        let loaded = registry.get(&device_id).unwrap();
        assert_eq!(loaded.model.as_deref(), Some("NanoSD"));
        assert!(registry
            .get_by_identifier("meteobridge", "aa:bb:cc:dd:ee:ff")
            .is_some());
    }
}
