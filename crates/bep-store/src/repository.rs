//! Storage interfaces used by the index engine and block transfer.

use bep_core::{DeviceId, FileBlocks, FileInfo, FolderStats, IndexInfo};

use crate::StoreError;

/// Source of the local index id and of monotonically increasing sequence
/// numbers for locally created records.
pub trait Sequencer: Send + Sync {
    /// Identifier of the local index.
    fn index_id(&self) -> Result<u64, StoreError>;

    /// Most recently issued sequence number.
    fn current_sequence(&self) -> Result<i64, StoreError>;

    /// Issues the next sequence number. Values are never reused.
    fn next_sequence(&self) -> Result<i64, StoreError>;
}

/// Durable index of files, blocks, per-peer progress and folder stats.
pub trait IndexRepository: Send + Sync {
    /// Local sequencer.
    fn sequencer(&self) -> &dyn Sequencer;

    /// Inserts or replaces the progress record of a (device, folder) pair.
    fn update_index_info(&self, info: &IndexInfo) -> Result<(), StoreError>;

    /// Looks up the progress record of a (device, folder) pair.
    fn find_index_info(&self, device_id: &DeviceId, folder: &str) -> Result<Option<IndexInfo>, StoreError>;

    /// Looks up a record, deleted or not.
    fn find_file_info(&self, folder: &str, path: &str) -> Result<Option<FileInfo>, StoreError>;

    /// Modification time of a record, if present.
    fn find_file_info_last_modified(&self, folder: &str, path: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.find_file_info(folder, path)?.map(|f| f.last_modified))
    }

    /// Looks up a record that is not a tombstone.
    fn find_not_deleted_file_info(&self, folder: &str, path: &str) -> Result<Option<FileInfo>, StoreError> {
        Ok(self.find_file_info(folder, path)?.filter(|f| !f.deleted))
    }

    /// Looks up the block list of a file.
    fn find_file_blocks(&self, folder: &str, path: &str) -> Result<Option<FileBlocks>, StoreError>;

    /// Stores a record with its optional block list and applies the folder
    /// stats delta in the same write. Returns the updated stats.
    fn update_file_info(&self, info: &FileInfo, blocks: Option<&FileBlocks>) -> Result<FolderStats, StoreError>;

    /// Lists live children of `parent` in a folder.
    fn find_not_deleted_files_by_folder_and_parent(
        &self,
        folder: &str,
        parent: &str,
    ) -> Result<Vec<FileInfo>, StoreError>;

    /// Case-insensitive file name search across all folders.
    fn find_file_info_by_search_term(&self, query: &str) -> Result<Vec<FileInfo>, StoreError>;

    /// Number of results `find_file_info_by_search_term` would return.
    fn count_file_info_by_search_term(&self, query: &str) -> Result<u64, StoreError> {
        Ok(self.find_file_info_by_search_term(query)?.len() as u64)
    }

    /// Stats of one folder.
    fn find_folder_stats(&self, folder: &str) -> Result<Option<FolderStats>, StoreError>;

    /// Stats of every folder with records.
    fn find_all_folder_stats(&self) -> Result<Vec<FolderStats>, StoreError>;

    /// Inserts or replaces folder stats.
    fn update_folder_stats(&self, stats: &FolderStats) -> Result<(), StoreError>;

    /// Removes every record, block list, progress record and stats entry.
    /// The sequencer is kept.
    fn clear_index(&self) -> Result<(), StoreError>;
}

/// Scratch storage for index batches waiting to be processed.
pub trait TempRepository: Send + Sync {
    /// Stores `data` and returns its key.
    fn push_temp_data(&self, data: &[u8]) -> Result<String, StoreError>;

    /// Returns and removes the data stored under `key`.
    fn pop_temp_data(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Removes data without reading it.
    fn delete_temp_data(&self, keys: &[String]) -> Result<(), StoreError>;
}

/// Case-insensitive match of a search query against a file name.
pub(crate) fn matches_search_term(info: &FileInfo, query: &str) -> bool {
    !info.deleted && info.file_name().to_lowercase().contains(&query.to_lowercase())
}
