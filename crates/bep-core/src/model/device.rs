use serde::{Deserialize, Serialize};

use crate::DeviceId;

/// A known peer device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device identity
    pub device_id: DeviceId,
    /// Display name, defaults to the short id
    pub name: String,
    /// Static addresses (`tcp://host:port`, `relay://...`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<String>,
}

impl DeviceInfo {
    /// Creates a peer entry; a blank name falls back to the short id.
    pub fn new(device_id: DeviceId, name: Option<&str>) -> Self {
        let name = match name {
            Some(name) if !name.trim().is_empty() => name.to_string(),
            _ => device_id.short_id(),
        };
        Self {
            device_id,
            name,
            addresses: Vec::new(),
        }
    }

    /// Adds a static address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.addresses.push(address.into());
        self
    }
}
