//! File records and their block lists.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::blocks::{hash_blocks, BlockInfo};
use crate::encoding::{DecodeError, RecordDecode, RecordEncode};
use crate::path;
use crate::CoreError;

/// Kind of index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    /// Regular file
    File,
    /// Directory
    Directory,
}

impl FileType {
    fn tag(self) -> u8 {
        match self {
            FileType::File => 0,
            FileType::Directory => 1,
        }
    }
}

/// One entry of a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Counter id, derived from the editing device
    pub id: u64,
    /// Counter value (the editing device's sequence)
    pub value: u64,
}

impl Version {
    /// Creates a new version entry.
    pub const fn new(id: u64, value: u64) -> Self {
        Self { id, value }
    }
}

/// Metadata of a file or directory within a folder.
///
/// Files always carry a size and a non-empty hash; directories carry neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Folder id
    pub folder: String,
    /// Folder-relative path
    pub path: String,
    /// Entry kind
    pub file_type: FileType,
    /// Size in bytes (files only)
    pub size: Option<u64>,
    /// Derived content hash (files only)
    pub hash: Option<String>,
    /// Modification time in milliseconds since the epoch
    pub last_modified: i64,
    /// Version vector
    pub versions: Vec<Version>,
    /// Tombstone flag
    pub deleted: bool,
}

impl FileInfo {
    /// Creates a file entry.
    pub fn file(
        folder: impl Into<String>,
        path: impl Into<String>,
        size: u64,
        hash: impl Into<String>,
        last_modified: i64,
    ) -> Result<Self, CoreError> {
        let hash = hash.into();
        let path = path.into();
        if hash.is_empty() {
            return Err(CoreError::InvalidRecord(format!("file {path} has no hash")));
        }
        Ok(Self {
            folder: folder.into(),
            path,
            file_type: FileType::File,
            size: Some(size),
            hash: Some(hash),
            last_modified,
            versions: Vec::new(),
            deleted: false,
        })
    }

    /// Creates a directory entry.
    pub fn directory(folder: impl Into<String>, path: impl Into<String>, last_modified: i64) -> Self {
        Self {
            folder: folder.into(),
            path: path.into(),
            file_type: FileType::Directory,
            size: None,
            hash: None,
            last_modified,
            versions: Vec::new(),
            deleted: false,
        }
    }

    /// The synthetic `..` entry used when browsing.
    pub fn parent_entry(folder: impl Into<String>) -> Self {
        Self::directory(folder, path::PARENT_PATH, 0)
    }

    /// The folder root.
    pub fn root(folder: impl Into<String>) -> Self {
        Self::directory(folder, path::ROOT_PATH, 0)
    }

    /// Sets the version vector.
    pub fn with_versions(mut self, versions: Vec<Version>) -> Self {
        self.versions = versions;
        self
    }

    /// Sets the tombstone flag.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Returns true for regular files.
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    /// Returns true for directories.
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Returns the last path segment.
    pub fn file_name(&self) -> &str {
        path::file_name(&self.path)
    }

    /// Returns the parent directory path.
    pub fn parent(&self) -> String {
        if path::is_parent(&self.path) {
            return path::ROOT_PATH.to_string();
        }
        path::parent_path(&self.path)
    }

    /// Returns a human readable size, or an empty string for directories.
    pub fn describe_size(&self) -> String {
        self.size.map(super::describe_size).unwrap_or_default()
    }
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_file() { "file" } else { "dir" };
        write!(f, "{}:{} ({kind}", self.folder, self.path)?;
        if let Some(size) = self.size {
            write!(f, ", {size} bytes")?;
        }
        if self.deleted {
            write!(f, ", deleted")?;
        }
        write!(f, ")")
    }
}

impl RecordEncode for FileInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.folder.encode(buf);
        self.path.encode(buf);
        self.file_type.tag().encode(buf);
        self.size.encode(buf);
        self.hash.encode(buf);
        self.last_modified.encode(buf);
        (self.versions.len() as u32).encode(buf);
        for version in &self.versions {
            version.id.encode(buf);
            version.value.encode(buf);
        }
        self.deleted.encode(buf);
    }
}

impl RecordDecode for FileInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let folder = String::decode(buf)?;
        let path = String::decode(buf)?;
        let file_type = match u8::decode(buf)? {
            0 => FileType::File,
            1 => FileType::Directory,
            other => return Err(DecodeError::InvalidTag(other as u32)),
        };
        let size = Option::<u64>::decode(buf)?;
        let hash = Option::<String>::decode(buf)?;
        let last_modified = i64::decode(buf)?;
        let count = u32::decode(buf)? as usize;
        let mut versions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            versions.push(Version::new(u64::decode(buf)?, u64::decode(buf)?));
        }
        let deleted = bool::decode(buf)?;
        Ok(Self {
            folder,
            path,
            file_type,
            size,
            hash,
            last_modified,
            versions,
            deleted,
        })
    }
}

/// Block list of a file. The hash and size are derived from the blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlocks {
    folder: String,
    path: String,
    blocks: Vec<BlockInfo>,
    hash: String,
    size: u64,
}

impl FileBlocks {
    /// Creates a block list, deriving its hash and size.
    pub fn new(folder: impl Into<String>, path: impl Into<String>, blocks: Vec<BlockInfo>) -> Self {
        let hash = hash_blocks(&blocks);
        let size = blocks.iter().map(|b| b.size as u64).sum();
        Self {
            folder: folder.into(),
            path: path.into(),
            blocks,
            hash,
            size,
        }
    }

    /// Folder id.
    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Folder-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Blocks in file order.
    pub fn blocks(&self) -> &[BlockInfo] {
        &self.blocks
    }

    /// Derived content hash.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Sum of the block sizes.
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl RecordEncode for FileBlocks {
    fn encode(&self, buf: &mut BytesMut) {
        self.folder.encode(buf);
        self.path.encode(buf);
        self.blocks.encode(buf);
    }
}

impl RecordDecode for FileBlocks {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let folder = String::decode(buf)?;
        let path = String::decode(buf)?;
        let blocks = Vec::<BlockInfo>::decode(buf)?;
        Ok(Self::new(folder, path, blocks))
    }
}

/// Verifies that `file_blocks` describes exactly the content of `file_info`.
pub fn check_blocks(file_info: &FileInfo, file_blocks: &FileBlocks) -> Result<(), CoreError> {
    let mismatch = |what: &str| {
        Err(CoreError::InconsistentBlocks(format!(
            "{what} mismatch for {}:{}",
            file_info.folder, file_info.path
        )))
    };

    if file_info.folder != file_blocks.folder {
        return mismatch("folder");
    }
    if file_info.path != file_blocks.path {
        return mismatch("path");
    }
    if !file_info.is_file() {
        return mismatch("type");
    }
    if file_info.size != Some(file_blocks.size) {
        return mismatch("size");
    }
    if file_info.hash.as_deref() != Some(file_blocks.hash.as_str()) {
        return mismatch("hash");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockList;

    fn sample_blocks() -> FileBlocks {
        let list = BlockList::from_bytes(&vec![7u8; 300_000]);
        FileBlocks::new("default", "dir/a.bin", list.blocks)
    }

    #[test]
    fn test_file_requires_hash() {
        assert!(FileInfo::file("f", "a", 1, "", 0).is_err());
        let file = FileInfo::file("f", "a", 1, "abc", 0).unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, Some(1));
    }

    #[test]
    fn test_directory_has_no_content() {
        let dir = FileInfo::directory("f", "a/b", 10);
        assert!(dir.is_directory());
        assert!(dir.size.is_none());
        assert!(dir.hash.is_none());
        assert_eq!(dir.parent(), "a");
        assert_eq!(dir.file_name(), "b");
    }

    #[test]
    fn test_parent_entry() {
        let parent = FileInfo::parent_entry("f");
        assert!(path::is_parent(&parent.path));
        assert!(parent.is_directory());
        assert_eq!(parent.parent(), "");
    }

    #[test]
    fn test_file_blocks_derived_fields() {
        let blocks = sample_blocks();
        assert_eq!(blocks.size(), 300_000);
        assert_eq!(blocks.blocks().len(), 3);
        assert_eq!(blocks.hash(), hash_blocks(blocks.blocks()));
    }

    #[test]
    fn test_check_blocks() {
        let blocks = sample_blocks();
        let file = FileInfo::file("default", "dir/a.bin", blocks.size(), blocks.hash(), 1).unwrap();
        assert!(check_blocks(&file, &blocks).is_ok());

        let mut wrong_hash = file.clone();
        wrong_hash.hash = Some("00".into());
        assert!(matches!(
            check_blocks(&wrong_hash, &blocks),
            Err(CoreError::InconsistentBlocks(_))
        ));

        let mut wrong_size = file.clone();
        wrong_size.size = Some(1);
        assert!(check_blocks(&wrong_size, &blocks).is_err());

        let dir = FileInfo::directory("default", "dir/a.bin", 1);
        assert!(check_blocks(&dir, &blocks).is_err());
    }

    #[test]
    fn test_file_info_record() {
        let file = FileInfo::file("default", "a.txt", 5, "abcd", 1_700_000_000_123)
            .unwrap()
            .with_versions(vec![Version::new(1, 2), Version::new(3, 4)])
            .with_deleted(true);
        let decoded = FileInfo::from_bytes(&file.to_vec()).unwrap();
        assert_eq!(decoded, file);
    }

    #[test]
    fn test_file_blocks_record_rederives_hash() {
        let blocks = sample_blocks();
        let decoded = FileBlocks::from_bytes(&blocks.to_vec()).unwrap();
        assert_eq!(decoded.hash(), blocks.hash());
        assert_eq!(decoded.size(), blocks.size());
    }
}
