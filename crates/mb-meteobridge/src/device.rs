//! Device identity binding
//!
//! Every configured bridge is registered as exactly one device, keyed by
//! its MAC address or, when the bridge reports none, by its API key.

use std::sync::Arc;

use mb_registries::{
    format_mac, DeviceConnection, DeviceEntry, DeviceIdentifier, DeviceRegistration,
    DeviceRegistry,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::{DEFAULT_BRAND, DOMAIN};
use crate::source::DeviceInfo;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("bridge reported neither a MAC address nor an API key")]
    MissingIdentity,

    #[error("bridge {key} is already configured by entry {entry_id}")]
    DuplicateDevice { key: String, entry_id: String },
}

/// Stable identity key: normalised MAC when present, else the API key
pub fn identity_key(info: &DeviceInfo) -> Result<String, BindError> {
    let non_empty = |s: &Option<String>| {
        s.as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    if let Some(mac) = non_empty(&info.mac) {
        return Ok(format_mac(&mac));
    }
    non_empty(&info.api_key).ok_or(BindError::MissingIdentity)
}

/// What the device registry learns about a bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub key: String,
    /// `<model> (<address>)`
    pub name: String,
    pub model: String,
    pub firmware: String,
    pub address: String,
    mac: Option<String>,
}

impl DeviceIdentity {
    pub fn from_info(info: &DeviceInfo) -> Result<Self, BindError> {
        let key = identity_key(info)?;
        let mac = info
            .mac
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(format_mac);

        Ok(Self {
            name: format!("{} ({})", info.model, info.address),
            model: info.model.clone(),
            firmware: info.firmware.clone(),
            address: info.address.clone(),
            key,
            mac,
        })
    }

    pub fn configuration_url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn identifier(&self) -> DeviceIdentifier {
        DeviceIdentifier::new(DOMAIN, self.key.clone())
    }

    pub fn registration(&self) -> DeviceRegistration {
        DeviceRegistration {
            identifiers: vec![self.identifier()],
            connections: self.mac.iter().map(|m| DeviceConnection::mac(m)).collect(),
            name: Some(self.name.clone()),
            manufacturer: Some(DEFAULT_BRAND.to_string()),
            model: Some(self.model.clone()),
            sw_version: Some(self.firmware.clone()),
            configuration_url: Some(self.configuration_url()),
        }
    }
}

/// Register the bridge's device for `config_entry_id`
///
/// Fails with [`BindError::DuplicateDevice`] when the identity is already
/// owned by a different config entry; nothing is registered in that case.
pub fn bind(
    devices: &DeviceRegistry,
    config_entry_id: &str,
    identity: &DeviceIdentity,
) -> Result<Arc<DeviceEntry>, BindError> {
    if let Some(existing) = devices.get_by_identifier(DOMAIN, &identity.key) {
        if let Some(owner) = existing
            .config_entries
            .iter()
            .find(|id| id.as_str() != config_entry_id)
        {
            warn!(
                "Bridge {} already configured by entry {}, refusing to bind entry {}",
                identity.key, owner, config_entry_id
            );
            return Err(BindError::DuplicateDevice {
                key: identity.key.clone(),
                entry_id: owner.clone(),
            });
        }
    }

    let device = devices.get_or_create(config_entry_id, &identity.registration());
    debug!("Bound bridge {} to device {}", identity.key, device.id);
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_registries::Storage;
    use tempfile::TempDir;

    fn info(mac: Option<&str>, api_key: Option<&str>) -> DeviceInfo {
        DeviceInfo {
            mac: mac.map(str::to_string),
            api_key: api_key.map(str::to_string),
            model: "NanoSD".to_string(),
            firmware: "5.7".to_string(),
            address: "10.0.0.5".to_string(),
        }
    }

    fn registry() -> (TempDir, DeviceRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = DeviceRegistry::new(Arc::new(Storage::new(dir.path())));
        (dir, registry)
    }

    #[test]
    fn test_identity_prefers_mac() {
        assert_eq!(
            identity_key(&info(Some("AA-BB-CC-DD-EE-FF"), Some("key1"))),
            Ok("aa:bb:cc:dd:ee:ff".to_string())
        );
        assert_eq!(identity_key(&info(Some(""), Some("key1"))), Ok("key1".to_string()));
        assert_eq!(identity_key(&info(None, None)), Err(BindError::MissingIdentity));
    }

    #[test]
    fn test_registration_fields() {
        let identity = DeviceIdentity::from_info(&info(Some("aabbccddeeff"), None)).unwrap();
        let registration = identity.registration();

        assert_eq!(registration.name.as_deref(), Some("NanoSD (10.0.0.5)"));
        assert_eq!(registration.manufacturer.as_deref(), Some("Meteobridge"));
        assert_eq!(
            registration.configuration_url.as_deref(),
            Some("http://10.0.0.5")
        );
        assert_eq!(registration.connections, vec![DeviceConnection::mac("aa:bb:cc:dd:ee:ff")]);
    }

    #[test]
    fn test_api_key_identity_has_no_connection() {
        let identity = DeviceIdentity::from_info(&info(None, Some("key1"))).unwrap();
        assert!(identity.registration().connections.is_empty());
    }

    #[test]
    fn test_second_entry_rejected() {
        let (_dir, devices) = registry();
        let identity = DeviceIdentity::from_info(&info(Some("aa:bb:cc:dd:ee:ff"), None)).unwrap();

        bind(&devices, "entry1", &identity).unwrap();
        let result = bind(&devices, "entry2", &identity);

        match result {
            Err(BindError::DuplicateDevice { key, entry_id }) => {
                assert_eq!(key, "aa:bb:cc:dd:ee:ff");
                assert_eq!(entry_id, "entry1");
            }
            other => panic!("expected duplicate, got {:?}", other.map(|d| d.id.clone())),
        }
        assert_eq!(devices.len(), 1);
        assert!(devices.get_by_config_entry_id("entry2").is_empty());
    }

    #[test]
    fn test_rebind_same_entry_reuses_device() {
        let (_dir, devices) = registry();
        let identity = DeviceIdentity::from_info(&info(Some("aa:bb:cc:dd:ee:ff"), None)).unwrap();

        let first = bind(&devices, "entry1", &identity).unwrap();
        let second = bind(&devices, "entry1", &identity).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.config_entries, vec!["entry1".to_string()]);
    }
}
