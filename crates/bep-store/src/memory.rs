//! In-memory repository.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};

use bep_core::path::parent_path;
use bep_core::{check_blocks, DeviceId, FileBlocks, FileInfo, FolderStats, IndexInfo};
use parking_lot::Mutex;
use rand::Rng;

use crate::repository::{matches_search_term, IndexRepository, Sequencer, TempRepository};
use crate::StoreError;

/// Sequencer that lives as long as the process.
#[derive(Debug)]
pub struct MemorySequencer {
    index_id: u64,
    sequence: AtomicI64,
}

impl MemorySequencer {
    /// Creates a sequencer with a random index id.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            index_id: rng.gen_range(1..=i64::MAX as u64),
            sequence: AtomicI64::new(0),
        }
    }
}

impl Default for MemorySequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer for MemorySequencer {
    fn index_id(&self) -> Result<u64, StoreError> {
        Ok(self.index_id)
    }

    fn current_sequence(&self) -> Result<i64, StoreError> {
        Ok(self.sequence.load(Ordering::SeqCst))
    }

    fn next_sequence(&self) -> Result<i64, StoreError> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[derive(Default)]
struct State {
    files: BTreeMap<(String, String), FileInfo>,
    blocks: HashMap<(String, String), FileBlocks>,
    index_infos: HashMap<(DeviceId, String), IndexInfo>,
    stats: BTreeMap<String, FolderStats>,
    temp: HashMap<String, Vec<u8>>,
}

/// Repository holding everything in memory. Implements both the index and
/// the temp repository.
#[derive(Default)]
pub struct MemoryRepository {
    sequencer: MemorySequencer,
    state: Mutex<State>,
}

impl MemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(folder: &str, path: &str) -> (String, String) {
    (folder.to_string(), path.to_string())
}

impl IndexRepository for MemoryRepository {
    fn sequencer(&self) -> &dyn Sequencer {
        &self.sequencer
    }

    fn update_index_info(&self, info: &IndexInfo) -> Result<(), StoreError> {
        self.state
            .lock()
            .index_infos
            .insert((info.device_id, info.folder.clone()), info.clone());
        Ok(())
    }

    fn find_index_info(&self, device_id: &DeviceId, folder: &str) -> Result<Option<IndexInfo>, StoreError> {
        Ok(self
            .state
            .lock()
            .index_infos
            .get(&(*device_id, folder.to_string()))
            .cloned())
    }

    fn find_file_info(&self, folder: &str, path: &str) -> Result<Option<FileInfo>, StoreError> {
        Ok(self.state.lock().files.get(&key(folder, path)).cloned())
    }

    fn find_file_blocks(&self, folder: &str, path: &str) -> Result<Option<FileBlocks>, StoreError> {
        Ok(self.state.lock().blocks.get(&key(folder, path)).cloned())
    }

    fn update_file_info(&self, info: &FileInfo, blocks: Option<&FileBlocks>) -> Result<FolderStats, StoreError> {
        if let Some(blocks) = blocks {
            check_blocks(info, blocks)?;
        }

        let mut state = self.state.lock();
        let k = key(&info.folder, &info.path);
        if let Some(blocks) = blocks {
            state.blocks.insert(k.clone(), blocks.clone());
        }
        let old = state.files.insert(k, info.clone());

        let stats = state
            .stats
            .entry(info.folder.clone())
            .or_insert_with(|| FolderStats::new(info.folder.clone()));
        stats.apply_update(old.as_ref(), info);
        Ok(stats.clone())
    }

    fn find_not_deleted_files_by_folder_and_parent(
        &self,
        folder: &str,
        parent: &str,
    ) -> Result<Vec<FileInfo>, StoreError> {
        Ok(self
            .state
            .lock()
            .files
            .range(key(folder, "")..)
            .take_while(|((f, _), _)| f == folder)
            .map(|(_, info)| info)
            .filter(|info| !info.deleted && !info.path.is_empty() && parent_path(&info.path) == parent)
            .cloned()
            .collect())
    }

    fn find_file_info_by_search_term(&self, query: &str) -> Result<Vec<FileInfo>, StoreError> {
        Ok(self
            .state
            .lock()
            .files
            .values()
            .filter(|info| matches_search_term(info, query))
            .cloned()
            .collect())
    }

    fn find_folder_stats(&self, folder: &str) -> Result<Option<FolderStats>, StoreError> {
        Ok(self.state.lock().stats.get(folder).cloned())
    }

    fn find_all_folder_stats(&self) -> Result<Vec<FolderStats>, StoreError> {
        Ok(self.state.lock().stats.values().cloned().collect())
    }

    fn update_folder_stats(&self, stats: &FolderStats) -> Result<(), StoreError> {
        self.state.lock().stats.insert(stats.folder.clone(), stats.clone());
        Ok(())
    }

    fn clear_index(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.files.clear();
        state.blocks.clear();
        state.index_infos.clear();
        state.stats.clear();
        state.temp.clear();
        Ok(())
    }
}

impl TempRepository for MemoryRepository {
    fn push_temp_data(&self, data: &[u8]) -> Result<String, StoreError> {
        let key = uuid::Uuid::new_v4().to_string();
        self.state.lock().temp.insert(key.clone(), data.to_vec());
        Ok(key)
    }

    fn pop_temp_data(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.state
            .lock()
            .temp
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(format!("temp data {key}")))
    }

    fn delete_temp_data(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        for key in keys {
            state.temp.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bep_core::BlockList;

    fn file(folder: &str, path: &str, size: u64, ts: i64) -> FileInfo {
        FileInfo::file(folder, path, size, "hash", ts).unwrap()
    }

    #[test]
    fn test_sequencer_monotonic() {
        let repo = MemoryRepository::new();
        let seq = repo.sequencer();
        let start = seq.current_sequence().unwrap();
        let a = seq.next_sequence().unwrap();
        let b = seq.next_sequence().unwrap();
        assert_eq!(a, start + 1);
        assert_eq!(b, a + 1);
        assert_eq!(seq.current_sequence().unwrap(), b);
        assert!(seq.index_id().unwrap() > 0);
    }

    #[test]
    fn test_update_file_info_stats() {
        let repo = MemoryRepository::new();
        let stats = repo.update_file_info(&file("f", "a.txt", 10, 1), None).unwrap();
        assert_eq!(stats.file_count, 1);
        let stats = repo
            .update_file_info(&FileInfo::directory("f", "dir", 2), None)
            .unwrap();
        assert_eq!(stats.dir_count, 1);
        let stats = repo
            .update_file_info(&file("f", "a.txt", 10, 3).with_deleted(true), None)
            .unwrap();
        assert_eq!(stats.file_count, 0);
        assert_eq!(stats.size, 0);
        assert_eq!(repo.find_folder_stats("f").unwrap(), Some(stats));
    }

    #[test]
    fn test_blocks_are_checked() {
        let repo = MemoryRepository::new();
        let list = BlockList::from_bytes(b"hello");
        let blocks = FileBlocks::new("f", "a", list.blocks.clone());
        let good = FileInfo::file("f", "a", list.size, list.hash.clone(), 1).unwrap();
        repo.update_file_info(&good, Some(&blocks)).unwrap();
        assert_eq!(repo.find_file_blocks("f", "a").unwrap(), Some(blocks.clone()));

        let bad = FileInfo::file("f", "a", list.size + 1, list.hash, 2).unwrap();
        assert!(repo.update_file_info(&bad, Some(&blocks)).is_err());
        assert_eq!(repo.find_file_info("f", "a").unwrap(), Some(good));
    }

    #[test]
    fn test_children_and_search() {
        let repo = MemoryRepository::new();
        repo.update_file_info(&FileInfo::directory("f", "docs", 1), None).unwrap();
        repo.update_file_info(&file("f", "docs/Report.pdf", 1, 1), None).unwrap();
        repo.update_file_info(&file("f", "docs/old.pdf", 1, 1).with_deleted(true), None).unwrap();
        repo.update_file_info(&file("f", "top.txt", 1, 1), None).unwrap();
        repo.update_file_info(&file("g", "docs/other.txt", 1, 1), None).unwrap();

        let root: Vec<_> = repo
            .find_not_deleted_files_by_folder_and_parent("f", "")
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(root, vec!["docs".to_string(), "top.txt".to_string()]);

        let docs = repo.find_not_deleted_files_by_folder_and_parent("f", "docs").unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].path, "docs/Report.pdf");

        assert_eq!(repo.count_file_info_by_search_term("report").unwrap(), 1);
        assert_eq!(repo.find_file_info_by_search_term("OLD").unwrap().len(), 0);
        assert_eq!(repo.find_file_info_last_modified("f", "top.txt").unwrap(), Some(1));
    }

    #[test]
    fn test_temp_data() {
        let repo = MemoryRepository::new();
        let a = repo.push_temp_data(b"first").unwrap();
        let b = repo.push_temp_data(b"second").unwrap();
        assert_ne!(a, b);
        assert_eq!(repo.pop_temp_data(&a).unwrap(), b"first");
        assert!(repo.pop_temp_data(&a).is_err());
        repo.delete_temp_data(&[b.clone()]).unwrap();
        assert!(repo.pop_temp_data(&b).is_err());
    }

    #[test]
    fn test_clear_index_keeps_sequence() {
        let repo = MemoryRepository::new();
        let seq = repo.sequencer().next_sequence().unwrap();
        repo.update_file_info(&file("f", "a", 1, 1), None).unwrap();
        repo.update_index_info(&IndexInfo::new("f", DeviceId::new([1; 32]), 5)).unwrap();
        repo.clear_index().unwrap();
        assert!(repo.find_file_info("f", "a").unwrap().is_none());
        assert!(repo.find_index_info(&DeviceId::new([1; 32]), "f").unwrap().is_none());
        assert!(repo.find_all_folder_stats().unwrap().is_empty());
        assert_eq!(repo.sequencer().current_sequence().unwrap(), seq);
    }
}
