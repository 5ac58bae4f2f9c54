//! Device identities and authentication
//!
//! Controllers introduce themselves with a four-word identity block (series, id,
//! secret, PLC version). The [`Authenticator`] maps the combined device id and
//! secret to a [`DeviceIdentity`]; [`DeviceRegistry`] is the file-backed
//! implementation used by the server.

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{PollerError, PollerResult};

/// Authenticated device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// `series << 16 | id`
    pub device_id: u64,
    pub series_id: u32,
    /// Firmware version, merged in from the handshake
    pub plc_version: u16,
    pub name: String,
    pub active: bool,
}

impl DeviceIdentity {
    /// Combine the series and id words of the identity block
    pub fn compose_id(series: u16, id: u16) -> u64 {
        ((series as u64) << 16) | id as u64
    }
}

/// Lookup of device credentials
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Return the identity registered for `device_id` if `secret` matches
    async fn authenticate_device(&self, device_id: u64, secret: u16) -> Option<DeviceIdentity>;
}

/// One registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: u64,
    /// Secret the device presents in its identity block
    pub code: u16,
    pub series_id: u32,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Read-only registry of known devices
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<u64, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new(records: Vec<DeviceRecord>) -> Self {
        let devices = records.into_iter().map(|r| (r.device_id, r)).collect();
        Self { devices }
    }

    /// Load a registry from a YAML (`.yaml`/`.yml`) or JSON (`.json`) list of records
    pub async fn load(path: impl AsRef<Path>) -> PollerResult<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            PollerError::configuration(format!("Cannot read device registry {}: {}", path.display(), e))
        })?;

        let records: Vec<DeviceRecord> = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)?,
            other => {
                return Err(PollerError::configuration(format!(
                    "Unsupported registry format: {:?}",
                    other
                )))
            }
        };

        info!("📇 Loaded {} device(s) from {}", records.len(), path.display());
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device_id: u64) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }
}

#[async_trait]
impl Authenticator for DeviceRegistry {
    async fn authenticate_device(&self, device_id: u64, secret: u16) -> Option<DeviceIdentity> {
        self.devices
            .get(&device_id)
            .filter(|record| record.code == secret)
            .map(|record| DeviceIdentity {
                device_id: record.device_id,
                series_id: record.series_id,
                plc_version: 0,
                name: record.name.clone(),
                active: record.active,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(vec![DeviceRecord {
            device_id: DeviceIdentity::compose_id(2, 7),
            code: 0x5A5A,
            series_id: 2,
            name: "Washer 7".to_string(),
            active: true,
        }])
    }

    #[test]
    fn test_compose_id() {
        assert_eq!(DeviceIdentity::compose_id(2, 7), 0x0002_0007);
        assert_eq!(DeviceIdentity::compose_id(0xFFFF, 0xFFFF), 0xFFFF_FFFF);
    }

    #[tokio::test]
    async fn test_authentication() {
        let registry = registry();
        let identity = registry
            .authenticate_device(0x0002_0007, 0x5A5A)
            .await
            .unwrap();
        assert_eq!(identity.series_id, 2);
        assert_eq!(identity.plc_version, 0);

        assert!(registry.authenticate_device(0x0002_0007, 0x1111).await.is_none());
        assert!(registry.authenticate_device(0x0003_0007, 0x5A5A).await.is_none());
    }

    #[tokio::test]
    async fn test_load_yaml_with_default_active() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.yaml");
        std::fs::write(
            &path,
            "- device_id: 131079\n  code: 23130\n  series_id: 2\n  name: Washer 7\n\
             - device_id: 131080\n  code: 1\n  series_id: 2\n  name: Dryer\n  active: false\n",
        )
        .unwrap();

        let registry = DeviceRegistry::load(&path).await.unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(131079).unwrap().active);
        assert!(!registry.get(131080).unwrap().active);
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.toml");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            DeviceRegistry::load(&path).await,
            Err(PollerError::Configuration { .. })
        ));
    }
}
