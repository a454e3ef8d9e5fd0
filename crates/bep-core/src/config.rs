//! Client configuration.
//!
//! The configuration is shared by every component of a client and is
//! persisted as TOML. Mutations mark it dirty; `persist` writes it back.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{DeviceInfo, FolderInfo};
use crate::{CoreError, DeviceId};

/// Default local device name.
pub const DEFAULT_DEVICE_NAME: &str = "bep-client";

/// Default global discovery servers.
pub const DEFAULT_DISCOVERY_SERVERS: &[&str] = &[
    "discovery.syncthing.net",
    "discovery-v4.syncthing.net",
    "discovery-v6.syncthing.net",
];

/// Protocol timeouts and intervals, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Wait for the peer's cluster config after connecting
    pub cluster_config_secs: u64,
    /// Wait for a peer's index to be acquired
    pub index_acquire_secs: u64,
    /// Ping period on idle connections
    pub ping_interval_secs: u64,
    /// Period of the client's index refresh
    pub index_update_interval_secs: u64,
    /// Wait for the response to one block request
    pub block_request_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            cluster_config_secs: 30,
            index_acquire_secs: 30,
            ping_interval_secs: 90,
            index_update_interval_secs: 15,
            block_request_secs: 60,
        }
    }
}

/// Serialized configuration contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigData {
    /// Name announced in Hello
    pub local_device_name: String,
    /// Identity derived from the keystore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_device_id: Option<DeviceId>,
    /// Keystore in PEM form (certificate and private key)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keystore: Option<String>,
    /// Global discovery servers
    #[serde(default = "default_discovery_servers")]
    pub discovery_servers: Vec<String>,
    /// Known folders
    #[serde(default)]
    pub folders: Vec<FolderInfo>,
    /// Known peers
    #[serde(default)]
    pub peers: Vec<DeviceInfo>,
    /// Protocol timeouts
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_discovery_servers() -> Vec<String> {
    DEFAULT_DISCOVERY_SERVERS.iter().map(|s| s.to_string()).collect()
}

impl Default for ConfigData {
    fn default() -> Self {
        Self {
            local_device_name: DEFAULT_DEVICE_NAME.to_string(),
            local_device_id: None,
            keystore: None,
            discovery_servers: default_discovery_servers(),
            folders: Vec::new(),
            peers: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }
}

/// Thread-safe configuration holder.
#[derive(Debug)]
pub struct Configuration {
    path: Option<PathBuf>,
    data: RwLock<ConfigData>,
    dirty: AtomicBool,
}

impl Configuration {
    /// Loads the configuration from `path`, starting from defaults if the
    /// file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let (data, dirty) = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let data: ConfigData =
                toml::from_str(&content).map_err(|e| CoreError::Config(e.to_string()))?;
            debug!(path = %path.display(), peers = data.peers.len(), folders = data.folders.len(), "loaded configuration");
            (data, false)
        } else {
            info!(path = %path.display(), "no configuration found, using defaults");
            (ConfigData::default(), true)
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(data),
            dirty: AtomicBool::new(dirty),
        })
    }

    /// Creates a configuration that is never written to disk.
    pub fn in_memory(data: ConfigData) -> Self {
        Self {
            path: None,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
        }
    }

    /// Configuration file path, if backed by a file.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Directory next to the configuration file used for the index database.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .and_then(|p| p.parent())
            .map(|dir| dir.join("database"))
    }

    /// Returns a snapshot of the contents.
    pub fn snapshot(&self) -> ConfigData {
        self.data.read().clone()
    }

    fn update<R>(&self, f: impl FnOnce(&mut ConfigData) -> R) -> R {
        let result = f(&mut self.data.write());
        self.dirty.store(true, Ordering::SeqCst);
        result
    }

    /// Writes the configuration back if it changed.
    pub fn persist(&self) -> Result<(), CoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let content = toml::to_string_pretty(&*self.data.read())
            .map_err(|e| CoreError::Config(e.to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        if let Err(e) = std::fs::write(path, content) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!(path = %path.display(), "persisted configuration");
        Ok(())
    }

    /// Name announced to peers.
    pub fn local_device_name(&self) -> String {
        self.data.read().local_device_name.clone()
    }

    /// Sets the announced name.
    pub fn set_local_device_name(&self, name: impl Into<String>) {
        let name = name.into();
        self.update(|data| data.local_device_name = name);
    }

    /// Local identity, once a keystore exists.
    pub fn local_device_id(&self) -> Option<DeviceId> {
        self.data.read().local_device_id
    }

    /// Keystore PEM data.
    pub fn keystore(&self) -> Option<String> {
        self.data.read().keystore.clone()
    }

    /// Stores a keystore and the identity derived from it.
    pub fn set_keystore(&self, device_id: DeviceId, pem: impl Into<String>) {
        let pem = pem.into();
        self.update(|data| {
            data.local_device_id = Some(device_id);
            data.keystore = Some(pem);
        });
    }

    /// Global discovery servers.
    pub fn discovery_servers(&self) -> Vec<String> {
        self.data.read().discovery_servers.clone()
    }

    /// Known folders.
    pub fn folders(&self) -> Vec<FolderInfo> {
        self.data.read().folders.clone()
    }

    /// Returns the folder with the given id.
    pub fn folder(&self, folder_id: &str) -> Option<FolderInfo> {
        self.data
            .read()
            .folders
            .iter()
            .find(|f| f.folder_id == folder_id)
            .cloned()
    }

    /// Adds or relabels a folder. Returns true if the folder was new.
    pub fn add_folder(&self, folder: FolderInfo) -> bool {
        self.update(|data| {
            match data.folders.iter_mut().find(|f| f.folder_id == folder.folder_id) {
                Some(existing) => {
                    *existing = folder;
                    false
                }
                None => {
                    data.folders.push(folder);
                    true
                }
            }
        })
    }

    /// Known peers.
    pub fn peers(&self) -> Vec<DeviceInfo> {
        self.data.read().peers.clone()
    }

    /// Known peer ids.
    pub fn peer_ids(&self) -> BTreeSet<DeviceId> {
        self.data.read().peers.iter().map(|p| p.device_id).collect()
    }

    /// Returns the peer with the given id.
    pub fn peer(&self, device_id: &DeviceId) -> Option<DeviceInfo> {
        self.data
            .read()
            .peers
            .iter()
            .find(|p| &p.device_id == device_id)
            .cloned()
    }

    /// Adds a peer, replacing an existing entry for the same device.
    pub fn add_peer(&self, peer: DeviceInfo) {
        self.update(|data| {
            data.peers.retain(|p| p.device_id != peer.device_id);
            data.peers.push(peer);
        });
    }

    /// Removes a peer. Returns true if it was known.
    pub fn remove_peer(&self, device_id: &DeviceId) -> bool {
        self.update(|data| {
            let before = data.peers.len();
            data.peers.retain(|p| &p.device_id != device_id);
            before != data.peers.len()
        })
    }

    /// Renames a known peer; unknown peers are ignored.
    pub fn update_peer_name(&self, device_id: &DeviceId, name: &str) {
        if name.trim().is_empty() {
            return;
        }
        let known = self
            .data
            .read()
            .peers
            .iter()
            .any(|p| &p.device_id == device_id && p.name != name);
        if known {
            self.update(|data| {
                if let Some(peer) = data.peers.iter_mut().find(|p| &p.device_id == device_id) {
                    peer.name = name.to_string();
                }
            });
        }
    }

    /// Protocol timeouts.
    pub fn timeouts(&self) -> Timeouts {
        self.data.read().timeouts
    }

    /// How long `connect` waits for the peer's cluster config.
    pub fn cluster_config_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts().cluster_config_secs)
    }

    /// How long to wait for a remote index.
    pub fn index_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts().index_acquire_secs)
    }

    /// Ping period.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts().ping_interval_secs)
    }

    /// Period of the client's index refresh.
    pub fn index_update_interval(&self) -> Duration {
        Duration::from_secs(self.timeouts().index_update_interval_secs)
    }

    /// How long a download waits for the response to a block request.
    pub fn block_request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts().block_request_secs)
    }
}
