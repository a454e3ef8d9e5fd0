//! RocksDB-backed repository.
//!
//! Column families:
//! - `file_info`: `folder \0 path` -> FileInfo
//! - `file_blocks`: `folder \0 path` -> FileBlocks
//! - `file_parent`: `folder \0 parent \0 path` -> empty (directory listing)
//! - `index_info`: `device (32 bytes) folder` -> IndexInfo
//! - `folder_stats`: `folder` -> FolderStats
//! - `temp`: uuid -> raw bytes
//! - `meta`: index id and sequence counter

use std::sync::Arc;

use bep_core::encoding::{RecordDecode, RecordEncode};
use bep_core::path::parent_path;
use bep_core::{check_blocks, DeviceId, FileBlocks, FileInfo, FolderStats, IndexInfo};
use parking_lot::Mutex;
use rand::Rng;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::repository::{matches_search_term, IndexRepository, Sequencer, TempRepository};
use crate::StoreError;

const FILE_INFO_CF: &str = "file_info";
const FILE_BLOCKS_CF: &str = "file_blocks";
const FILE_PARENT_CF: &str = "file_parent";
const INDEX_INFO_CF: &str = "index_info";
const FOLDER_STATS_CF: &str = "folder_stats";
const TEMP_CF: &str = "temp";
const META_CF: &str = "meta";

const INDEX_ID_KEY: &[u8] = b"index_id";
const SEQUENCE_KEY: &[u8] = b"sequence";

const INDEX_CFS: [&str; 5] = [FILE_INFO_CF, FILE_BLOCKS_CF, FILE_PARENT_CF, INDEX_INFO_CF, FOLDER_STATS_CF];

fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily, StoreError> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Database(format!("Missing {name} column family")))
}

fn file_key(folder: &str, path: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(folder.len() + path.len() + 1);
    key.extend_from_slice(folder.as_bytes());
    key.push(0);
    key.extend_from_slice(path.as_bytes());
    key
}

fn parent_prefix(folder: &str, parent: &str) -> Vec<u8> {
    let mut key = file_key(folder, parent);
    key.push(0);
    key
}

fn index_info_key(device_id: &DeviceId, folder: &str) -> Vec<u8> {
    let mut key = device_id.as_bytes().to_vec();
    key.extend_from_slice(folder.as_bytes());
    key
}

fn read_i64(bytes: &[u8]) -> Result<i64, StoreError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData(format!("expected 8 bytes, got {}", bytes.len())))?;
    Ok(i64::from_be_bytes(raw))
}

/// Sequencer persisted in the `meta` column family.
pub struct RocksSequencer {
    db: Arc<DB>,
    index_id: u64,
    lock: Mutex<()>,
    sync_writes: bool,
}

impl RocksSequencer {
    fn open(db: Arc<DB>, sync_writes: bool) -> Result<Self, StoreError> {
        let meta = cf(&db, META_CF)?;
        let index_id = match db.get_cf(meta, INDEX_ID_KEY).map_err(db_err)? {
            Some(bytes) => read_i64(&bytes)? as u64,
            None => {
                let mut rng = rand::thread_rng();
                let index_id = rng.gen_range(1..i64::MAX) as u64;
                let sequence = rng.gen_range(1..=u32::MAX as i64);
                let mut batch = WriteBatch::default();
                batch.put_cf(meta, INDEX_ID_KEY, (index_id as i64).to_be_bytes());
                batch.put_cf(meta, SEQUENCE_KEY, sequence.to_be_bytes());
                db.write(batch).map_err(db_err)?;
                info!(index_id, sequence, "created local index");
                index_id
            }
        };

        Ok(Self {
            db,
            index_id,
            lock: Mutex::new(()),
            sync_writes,
        })
    }
}

impl Sequencer for RocksSequencer {
    fn index_id(&self) -> Result<u64, StoreError> {
        Ok(self.index_id)
    }

    fn current_sequence(&self) -> Result<i64, StoreError> {
        let meta = cf(&self.db, META_CF)?;
        match self.db.get_cf(meta, SEQUENCE_KEY).map_err(db_err)? {
            Some(bytes) => read_i64(&bytes),
            None => Err(StoreError::NotFound("sequence".into())),
        }
    }

    fn next_sequence(&self) -> Result<i64, StoreError> {
        let _guard = self.lock.lock();
        let next = self.current_sequence()? + 1;
        let meta = cf(&self.db, META_CF)?;
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db
            .put_cf_opt(meta, SEQUENCE_KEY, next.to_be_bytes(), &opts)
            .map_err(db_err)?;
        Ok(next)
    }
}

/// Repository on a RocksDB database. Implements both the index and the temp
/// repository.
pub struct RocksRepository {
    db: Arc<DB>,
    sequencer: RocksSequencer,
    write_lock: Mutex<()>,
    sync_writes: bool,
}

impl RocksRepository {
    /// Opens (or creates) the repository described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        config.create_dirs()?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        if !config.compression {
            opts.set_compression_type(rocksdb::DBCompressionType::None);
        }

        let path = config.index_path();
        let db = DB::open_cf(
            &opts,
            &path,
            [FILE_INFO_CF, FILE_BLOCKS_CF, FILE_PARENT_CF, INDEX_INFO_CF, FOLDER_STATS_CF, TEMP_CF, META_CF],
        )
        .map_err(db_err)?;
        let db = Arc::new(db);

        let sequencer = RocksSequencer::open(db.clone(), config.sync_writes)?;
        let repo = Self {
            db,
            sequencer,
            write_lock: Mutex::new(()),
            sync_writes: config.sync_writes,
        };
        // Batches queued by a previous session are stale.
        repo.clear_cf(TEMP_CF)?;
        debug!(path = %path.display(), "opened index repository");
        Ok(repo)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts).map_err(db_err)
    }

    fn get<T: RecordDecode>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let handle = cf(&self.db, cf_name)?;
        match self.db.get_cf(handle, key).map_err(db_err)? {
            Some(bytes) => Ok(Some(T::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_prefix(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let handle = cf(&self.db, cf_name)?;
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(handle, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }
        Ok(entries)
    }

    fn clear_cf(&self, cf_name: &str) -> Result<(), StoreError> {
        let handle = cf(&self.db, cf_name)?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (key, _) = item.map_err(db_err)?;
            batch.delete_cf(handle, key);
        }
        self.write(batch)
    }
}

impl IndexRepository for RocksRepository {
    fn sequencer(&self) -> &dyn Sequencer {
        &self.sequencer
    }

    fn update_index_info(&self, info: &IndexInfo) -> Result<(), StoreError> {
        let handle = cf(&self.db, INDEX_INFO_CF)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(handle, index_info_key(&info.device_id, &info.folder), info.to_vec());
        self.write(batch)
    }

    fn find_index_info(&self, device_id: &DeviceId, folder: &str) -> Result<Option<IndexInfo>, StoreError> {
        self.get(INDEX_INFO_CF, &index_info_key(device_id, folder))
    }

    fn find_file_info(&self, folder: &str, path: &str) -> Result<Option<FileInfo>, StoreError> {
        self.get(FILE_INFO_CF, &file_key(folder, path))
    }

    fn find_file_blocks(&self, folder: &str, path: &str) -> Result<Option<FileBlocks>, StoreError> {
        self.get(FILE_BLOCKS_CF, &file_key(folder, path))
    }

    fn update_file_info(&self, info: &FileInfo, blocks: Option<&FileBlocks>) -> Result<FolderStats, StoreError> {
        if let Some(blocks) = blocks {
            check_blocks(info, blocks)?;
        }

        let _guard = self.write_lock.lock();
        let key = file_key(&info.folder, &info.path);
        let old: Option<FileInfo> = self.get(FILE_INFO_CF, &key)?;
        let mut stats = self
            .find_folder_stats(&info.folder)?
            .unwrap_or_else(|| FolderStats::new(info.folder.clone()));
        stats.apply_update(old.as_ref(), info);

        let mut batch = WriteBatch::default();
        if let Some(blocks) = blocks {
            batch.put_cf(cf(&self.db, FILE_BLOCKS_CF)?, &key, blocks.to_vec());
        }
        batch.put_cf(cf(&self.db, FILE_INFO_CF)?, &key, info.to_vec());
        if !info.path.is_empty() {
            let mut parent_key = parent_prefix(&info.folder, &parent_path(&info.path));
            parent_key.extend_from_slice(info.path.as_bytes());
            batch.put_cf(cf(&self.db, FILE_PARENT_CF)?, parent_key, b"");
        }
        batch.put_cf(cf(&self.db, FOLDER_STATS_CF)?, info.folder.as_bytes(), stats.to_vec());
        self.write(batch)?;
        Ok(stats)
    }

    fn find_not_deleted_files_by_folder_and_parent(
        &self,
        folder: &str,
        parent: &str,
    ) -> Result<Vec<FileInfo>, StoreError> {
        let prefix = parent_prefix(folder, parent);
        let mut files = Vec::new();
        for (key, _) in self.scan_prefix(FILE_PARENT_CF, &prefix)? {
            let path = std::str::from_utf8(&key[prefix.len()..])
                .map_err(|e| StoreError::InvalidData(e.to_string()))?;
            // A parent prefix also matches deeper paths that contain `\0`.
            if parent_path(path) != parent {
                continue;
            }
            if let Some(info) = self.find_not_deleted_file_info(folder, path)? {
                files.push(info);
            }
        }
        Ok(files)
    }

    fn find_file_info_by_search_term(&self, query: &str) -> Result<Vec<FileInfo>, StoreError> {
        let handle = cf(&self.db, FILE_INFO_CF)?;
        let mut files = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            let info = FileInfo::from_bytes(&value)?;
            if matches_search_term(&info, query) {
                files.push(info);
            }
        }
        Ok(files)
    }

    fn find_folder_stats(&self, folder: &str) -> Result<Option<FolderStats>, StoreError> {
        self.get(FOLDER_STATS_CF, folder.as_bytes())
    }

    fn find_all_folder_stats(&self) -> Result<Vec<FolderStats>, StoreError> {
        let handle = cf(&self.db, FOLDER_STATS_CF)?;
        let mut stats = Vec::new();
        for item in self.db.iterator_cf(handle, IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            stats.push(FolderStats::from_bytes(&value)?);
        }
        Ok(stats)
    }

    fn update_folder_stats(&self, stats: &FolderStats) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf(&self.db, FOLDER_STATS_CF)?, stats.folder.as_bytes(), stats.to_vec());
        self.write(batch)
    }

    fn clear_index(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        for name in INDEX_CFS.iter().chain([TEMP_CF].iter()) {
            self.clear_cf(name)?;
        }
        info!("cleared index");
        Ok(())
    }
}

impl TempRepository for RocksRepository {
    fn push_temp_data(&self, data: &[u8]) -> Result<String, StoreError> {
        let key = uuid::Uuid::new_v4().to_string();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf(&self.db, TEMP_CF)?, key.as_bytes(), data);
        self.write(batch)?;
        Ok(key)
    }

    fn pop_temp_data(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let handle = cf(&self.db, TEMP_CF)?;
        let data = self
            .db
            .get_cf(handle, key.as_bytes())
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("temp data {key}")))?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(handle, key.as_bytes());
        self.write(batch)?;
        Ok(data)
    }

    fn delete_temp_data(&self, keys: &[String]) -> Result<(), StoreError> {
        let handle = cf(&self.db, TEMP_CF)?;
        let mut batch = WriteBatch::default();
        for key in keys {
            batch.delete_cf(handle, key.as_bytes());
        }
        self.write(batch)
    }
}
