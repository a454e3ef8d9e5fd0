//! Folder sharing negotiated through cluster config messages.

use std::collections::BTreeMap;

use bep_core::{DeviceId, FolderInfo};
use bep_proto::bep::{ClusterConfig, Device, Folder};
use tracing::warn;

/// Sharing state of one folder on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfigFolderInfo {
    /// Folder id
    pub folder_id: String,
    /// Label announced by the peer
    pub label: String,
    /// The peer lists itself as a member
    pub is_announced: bool,
    /// The peer lists us as a member
    pub is_shared: bool,
}

impl ClusterConfigFolderInfo {
    /// Folder descriptor for the configuration.
    pub fn folder_info(&self) -> FolderInfo {
        FolderInfo::new(self.folder_id.as_str(), Some(&self.label))
    }
}

/// Folders announced in the peer's cluster config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfigInfo {
    folders: BTreeMap<String, ClusterConfigFolderInfo>,
}

impl ClusterConfigInfo {
    /// Evaluates a received cluster config from the point of view of
    /// `local` talking to `peer`.
    pub fn from_message(message: &ClusterConfig, local: &DeviceId, peer: &DeviceId) -> Self {
        let mut folders = BTreeMap::new();
        for folder in &message.folders {
            let mut info = ClusterConfigFolderInfo {
                folder_id: folder.id.clone(),
                label: folder.label.clone(),
                is_announced: false,
                is_shared: false,
            };
            for device in &folder.devices {
                match DeviceId::from_hash(&device.id) {
                    Ok(id) if &id == peer => info.is_announced = true,
                    Ok(id) if &id == local => info.is_shared = true,
                    Ok(_) => {}
                    Err(e) => warn!(folder = %folder.id, error = %e, "invalid device in cluster config"),
                }
            }
            folders.insert(folder.id.clone(), info);
        }
        Self { folders }
    }

    /// Every announced folder.
    pub fn folders(&self) -> impl Iterator<Item = &ClusterConfigFolderInfo> {
        self.folders.values()
    }

    /// Looks up one folder.
    pub fn folder(&self, folder: &str) -> Option<&ClusterConfigFolderInfo> {
        self.folders.get(folder)
    }

    /// Ids of folders the peer shares with us.
    pub fn shared_folder_ids(&self) -> Vec<String> {
        self.folders
            .values()
            .filter(|f| f.is_shared)
            .map(|f| f.folder_id.clone())
            .collect()
    }

    /// True if the peer shares `folder` with us.
    pub fn is_shared(&self, folder: &str) -> bool {
        self.folders.get(folder).is_some_and(|f| f.is_shared)
    }
}

/// Device entry for a cluster config folder.
pub(crate) fn device_entry(device_id: &DeviceId, name: &str, index_id: u64, max_sequence: i64) -> Device {
    Device {
        id: device_id.to_hash_data(),
        name: name.to_string(),
        index_id,
        max_sequence,
        ..Default::default()
    }
}

/// Folder entry for a cluster config.
pub(crate) fn folder_entry(folder: &FolderInfo, devices: Vec<Device>) -> Folder {
    Folder {
        id: folder.folder_id.clone(),
        label: folder.label.clone(),
        devices,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> DeviceId {
        DeviceId::from_hash(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_announced_and_shared() {
        let (local, peer, other) = (id(1), id(2), id(3));
        let message = ClusterConfig {
            folders: vec![
                folder_entry(
                    &FolderInfo::new("both", Some("Both")),
                    vec![device_entry(&peer, "peer", 0, 0), device_entry(&local, "me", 0, 0)],
                ),
                folder_entry(
                    &FolderInfo::new("theirs", None),
                    vec![device_entry(&peer, "peer", 0, 0), device_entry(&other, "x", 0, 0)],
                ),
            ],
        };

        let info = ClusterConfigInfo::from_message(&message, &local, &peer);
        let both = info.folder("both").unwrap();
        assert!(both.is_announced && both.is_shared);
        assert_eq!(both.folder_info().label, "Both");
        let theirs = info.folder("theirs").unwrap();
        assert!(theirs.is_announced && !theirs.is_shared);
        assert_eq!(info.shared_folder_ids(), vec!["both".to_string()]);
        assert!(!info.is_shared("unknown"));
    }

    #[test]
    fn test_invalid_device_is_ignored() {
        let (local, peer) = (id(1), id(2));
        let mut folder = folder_entry(&FolderInfo::new("f", None), vec![device_entry(&local, "me", 0, 0)]);
        folder.devices.push(Device {
            id: vec![1, 2, 3],
            ..Default::default()
        });
        let info = ClusterConfigInfo::from_message(&ClusterConfig { folders: vec![folder] }, &local, &peer);
        assert!(info.is_shared("f"));
        assert!(!info.folder("f").unwrap().is_announced);
    }
}
