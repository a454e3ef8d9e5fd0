//! Folder descriptors and aggregate folder statistics.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::{DecodeError, RecordDecode, RecordEncode};
use crate::model::{describe_size, FileInfo, FileType};

/// A shared folder. Identity is the folder id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FolderInfo {
    /// Folder id, identical on every device sharing the folder
    pub folder_id: String,
    /// Display label
    pub label: String,
}

impl FolderInfo {
    /// Creates a folder; an empty label falls back to the folder id.
    pub fn new(folder_id: impl Into<String>, label: Option<&str>) -> Self {
        let folder_id = folder_id.into();
        let label = match label {
            Some(label) if !label.trim().is_empty() => label.to_string(),
            _ => folder_id.clone(),
        };
        Self { folder_id, label }
    }
}

impl fmt::Display for FolderInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.label, self.folder_id)
    }
}

/// Aggregate counters for a folder, updated incrementally on every upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderStats {
    /// Folder id
    pub folder: String,
    /// Folder label
    pub label: String,
    /// Number of present files
    pub file_count: u64,
    /// Number of present directories
    pub dir_count: u64,
    /// Total size of present files
    pub size: u64,
    /// Timestamp of the most recent update, ms since epoch
    pub last_update: i64,
}

impl FolderStats {
    /// Creates empty stats for a folder.
    pub fn new(folder: impl Into<String>) -> Self {
        let folder = folder.into();
        Self {
            label: folder.clone(),
            folder,
            ..Default::default()
        }
    }

    /// Creates empty stats carrying the folder's label.
    pub fn for_folder(folder: &FolderInfo) -> Self {
        Self {
            folder: folder.folder_id.clone(),
            label: folder.label.clone(),
            ..Default::default()
        }
    }

    /// Files plus directories.
    pub fn record_count(&self) -> u64 {
        self.file_count + self.dir_count
    }

    /// Human readable total size.
    pub fn describe_size(&self) -> String {
        describe_size(self.size)
    }

    /// Applies the delta of replacing `old` with `new`.
    ///
    /// Deleted or absent entries contribute nothing; sizes only count for
    /// files.
    pub fn apply_update(&mut self, old: Option<&FileInfo>, new: &FileInfo) {
        if let Some(old) = old.filter(|old| !old.deleted) {
            match old.file_type {
                FileType::File => {
                    self.file_count = self.file_count.saturating_sub(1);
                    self.size = self.size.saturating_sub(old.size.unwrap_or(0));
                }
                FileType::Directory => {
                    self.dir_count = self.dir_count.saturating_sub(1);
                }
            }
        }

        if !new.deleted {
            match new.file_type {
                FileType::File => {
                    self.file_count += 1;
                    self.size += new.size.unwrap_or(0);
                }
                FileType::Directory => {
                    self.dir_count += 1;
                }
            }
        }

        self.last_update = new.last_modified;
    }
}

impl fmt::Display for FolderStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "folder {}: {} files, {} dirs, {}",
            self.label,
            self.file_count,
            self.dir_count,
            self.describe_size()
        )
    }
}

impl RecordEncode for FolderStats {
    fn encode(&self, buf: &mut BytesMut) {
        self.folder.encode(buf);
        self.label.encode(buf);
        self.file_count.encode(buf);
        self.dir_count.encode(buf);
        self.size.encode(buf);
        self.last_update.encode(buf);
    }
}

impl RecordDecode for FolderStats {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            folder: String::decode(buf)?,
            label: String::decode(buf)?,
            file_count: u64::decode(buf)?,
            dir_count: u64::decode(buf)?,
            size: u64::decode(buf)?,
            last_update: i64::decode(buf)?,
        })
    }
}
