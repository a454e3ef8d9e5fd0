//! The index engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bep_core::time::millis_from_parts;
use bep_core::{
    check_blocks, BlockInfo, Configuration, DeviceId, FileBlocks, FileInfo, FolderInfo, IndexInfo, Version,
};
use bep_proto::bep::{self, ClusterConfig, FileInfoType, IndexUpdate};
use bep_store::{IndexRepository, Sequencer, StoreError, TempRepository};
use parking_lot::{Condvar, Mutex, ReentrantMutex, RwLock};
use prost::Message as _;
use tracing::{debug, error, info, trace, warn};

use crate::browser::{BrowserOptions, IndexBrowser};
use crate::events::{FullIndexAcquired, IndexChange, IndexRecordsAcquired, ListenerId, Listeners};
use crate::folder_browser::FolderBrowser;
use crate::queue::{IndexQueue, Job};
use crate::{IndexError, IndexPeer};

/// Merges peer index batches into the local repository and tracks how much
/// of every peer's index has been applied.
///
/// Created behind an `Arc`; the batch worker holds a weak reference.
pub struct IndexHandler {
    config: Arc<Configuration>,
    repository: Arc<dyn IndexRepository>,
    temp: Arc<dyn TempRepository>,
    folders: RwLock<BTreeMap<String, FolderInfo>>,
    write_lock: ReentrantMutex<()>,
    last_activity: Mutex<Option<Instant>>,
    index_wait: Mutex<()>,
    index_acquired: Condvar,
    queue: IndexQueue,
    record_listeners: Listeners<IndexRecordsAcquired>,
    full_index_listeners: Listeners<FullIndexAcquired>,
    change_listeners: Listeners<IndexChange>,
}

impl IndexHandler {
    /// Creates the engine and starts its batch worker. Folders known to the
    /// configuration are loaded immediately.
    pub fn new(
        config: Arc<Configuration>,
        repository: Arc<dyn IndexRepository>,
        temp: Arc<dyn TempRepository>,
    ) -> Arc<Self> {
        let handler = Arc::new_cyclic(|weak: &Weak<IndexHandler>| Self {
            config,
            repository,
            temp,
            folders: RwLock::new(BTreeMap::new()),
            write_lock: ReentrantMutex::new(()),
            last_activity: Mutex::new(None),
            index_wait: Mutex::new(()),
            index_acquired: Condvar::new(),
            queue: IndexQueue::start(weak.clone()),
            record_listeners: Listeners::new(),
            full_index_listeners: Listeners::new(),
            change_listeners: Listeners::new(),
        });
        handler.load_folders_from_config();
        handler
    }

    fn load_folders_from_config(&self) {
        let _guard = self.write_lock.lock();
        let mut folders = self.folders.write();
        for folder in self.config.folders() {
            folders.insert(folder.folder_id.clone(), folder);
        }
    }

    /// Repository backing the index.
    pub fn repository(&self) -> &Arc<dyn IndexRepository> {
        &self.repository
    }

    /// Durable local sequencer.
    pub fn sequencer(&self) -> &dyn Sequencer {
        self.repository.sequencer()
    }

    fn mark_active(&self) {
        *self.last_activity.lock() = Some(Instant::now());
    }

    /// Time since the engine last processed anything.
    pub fn last_active(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX)
    }

    /// Ids of known folders.
    pub fn folder_list(&self) -> Vec<String> {
        self.folders.read().keys().cloned().collect()
    }

    /// Known folders.
    pub fn folder_info_list(&self) -> Vec<FolderInfo> {
        self.folders.read().values().cloned().collect()
    }

    /// Looks up a known folder.
    pub fn folder_info(&self, folder: &str) -> Option<FolderInfo> {
        self.folders.read().get(folder).cloned()
    }

    /// Progress record of a peer for a folder.
    pub fn index_info(&self, device_id: &DeviceId, folder: &str) -> Result<Option<IndexInfo>, IndexError> {
        Ok(self.repository.find_index_info(device_id, folder)?)
    }

    /// Removes every record and progress entry and reloads folders from the
    /// configuration.
    pub fn clear_index(&self) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock();
        self.repository.clear_index()?;
        self.folders.write().clear();
        self.load_folders_from_config();
        info!("index cleared");
        Ok(())
    }

    /// Returns true when, for every folder shared on `peer`, a progress
    /// record exists and has caught up with the peer's max sequence.
    pub fn is_remote_index_acquired(&self, peer: &dyn IndexPeer) -> Result<bool, IndexError> {
        let device_id = peer.device_id();
        let mut ready = true;
        for folder in peer.shared_folders() {
            match self.repository.find_index_info(&device_id, &folder)? {
                Some(info) if info.is_acquired() => {}
                info => {
                    debug!(folder = %folder, info = ?info, "waiting for index");
                    ready = false;
                }
            }
        }
        Ok(ready)
    }

    /// Blocks until the index of `peer` is acquired. Fails once both the
    /// peer and the engine have been idle for longer than the timeout
    /// (configured index acquire timeout when `None`).
    pub fn wait_for_remote_index_acquired(
        &self,
        peer: &dyn IndexPeer,
        timeout: Option<Duration>,
    ) -> Result<(), IndexError> {
        let timeout = timeout.unwrap_or_else(|| self.config.index_acquire_timeout());
        let mut guard = self.index_wait.lock();
        while !self.is_remote_index_acquired(peer)? {
            self.index_acquired.wait_for(&mut guard, timeout);
            if peer.last_active() >= timeout && self.last_active() >= timeout {
                return Err(IndexError::Timeout(format!(
                    "unable to acquire index from {}",
                    peer.device_id()
                )));
            }
        }
        debug!(peer = %peer.device_id(), "acquired all indexes");
        Ok(())
    }

    /// Applies folder labels and peer progress announced in a cluster
    /// config. Devices without an index id are skipped.
    pub fn handle_cluster_config_message_processed_event(&self, cluster_config: &ClusterConfig) -> Result<(), IndexError> {
        let _guard = self.write_lock.lock();
        for folder in &cluster_config.folders {
            let folder_info = self.update_folder_info(&folder.id, &folder.label);
            debug!(folder = %folder_info, "acquired folder info from cluster config");
            for device in &folder.devices {
                if device.index_id == 0 {
                    continue;
                }
                let device_id = match DeviceId::from_hash(&device.id) {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(folder = %folder.id, error = %e, "skipping device with invalid id");
                        continue;
                    }
                };
                let info = self.update_index_info(
                    &folder.id,
                    device_id,
                    Some(device.index_id),
                    Some(device.max_sequence),
                    None,
                )?;
                debug!(info = ?info, "acquired folder index info from cluster config");
            }
        }
        Ok(())
    }

    fn update_folder_info(&self, folder: &str, label: &str) -> FolderInfo {
        let mut folders = self.folders.write();
        match folders.get(folder) {
            Some(existing) if label.trim().is_empty() => existing.clone(),
            _ => {
                let info = FolderInfo::new(folder, Some(label));
                folders.insert(folder.to_string(), info.clone());
                info
            }
        }
    }

    /// Creates or advances a progress record.
    ///
    /// A missing record is created with `local 0, max -1` and needs an index
    /// id. Existing records change only on a new index id or when max or
    /// local sequence increases.
    pub fn update_index_info(
        &self,
        folder: &str,
        device_id: DeviceId,
        index_id: Option<u64>,
        max_sequence: Option<i64>,
        local_sequence: Option<i64>,
    ) -> Result<IndexInfo, IndexError> {
        let _guard = self.write_lock.lock();
        let (mut info, mut changed) = match self.repository.find_index_info(&device_id, folder)? {
            Some(info) => (info, false),
            None => {
                let index_id = index_id.ok_or_else(|| IndexError::MissingIndexInfo {
                    device: device_id,
                    folder: folder.to_string(),
                })?;
                (IndexInfo::new(folder, device_id, index_id), true)
            }
        };

        if let Some(index_id) = index_id {
            if index_id != info.index_id {
                info.index_id = index_id;
                changed = true;
            }
        }
        if let Some(max) = max_sequence {
            if max > info.max_sequence {
                info.max_sequence = max;
                changed = true;
            }
        }
        if let Some(local) = local_sequence {
            if local > info.local_sequence {
                info.local_sequence = local;
                changed = true;
            }
        }
        if changed {
            self.repository.update_index_info(&info)?;
        }
        Ok(info)
    }

    /// Queues a batch received from `peer`.
    pub fn handle_index_message_received_event(
        &self,
        folder: &str,
        files: Vec<bep::FileInfo>,
        peer: Arc<dyn IndexPeer>,
    ) -> Result<(), IndexError> {
        info!(
            folder = %folder,
            records = files.len(),
            queued_records = self.queue.pending_records(),
            "received index message"
        );
        self.mark_active();
        let update = IndexUpdate {
            folder: folder.to_string(),
            files,
        };

        let job = if self.queue.pending() > 0 {
            let records = update.files.len();
            let key = self.temp.push_temp_data(&update.encode_to_vec())?;
            debug!(key = %key, "stored index batch to temp record");
            Job::Stored { key, records, peer }
        } else {
            Job::Batch { update, peer }
        };
        self.queue.submit(job)
    }

    pub(crate) fn process_job(&self, job: Job) {
        let (update, peer) = match job {
            Job::Batch { update, peer } => (update, peer),
            Job::Stored { key, peer, .. } => {
                self.mark_active();
                let decoded = self
                    .temp
                    .pop_temp_data(&key)
                    .map_err(IndexError::from)
                    .and_then(|data| IndexUpdate::decode(data.as_slice()).map_err(IndexError::from));
                match decoded {
                    Ok(update) => (update, peer),
                    Err(e) => {
                        error!(key = %key, error = %e, "error loading parked index batch");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.process_update(&update, peer.as_ref()) {
            error!(folder = %update.folder, error = %e, "error processing index message");
        }

        self.mark_active();
        let _guard = self.index_wait.lock();
        self.index_acquired.notify_all();
    }

    fn process_update(&self, update: &IndexUpdate, peer: &dyn IndexPeer) -> Result<(), IndexError> {
        let start = Instant::now();
        let folder = &update.folder;
        let mut sequence = -1;
        let mut new_records = Vec::new();

        let index_info = {
            let _guard = self.write_lock.lock();
            for file in &update.files {
                self.mark_active();
                match self.push_record(folder, file) {
                    Ok(Some(record)) => new_records.push(record),
                    Ok(None) => {}
                    Err(IndexError::Store(StoreError::Core(e))) => {
                        warn!(folder = %folder, path = %file.name, error = %e, "discarding inconsistent record");
                    }
                    Err(e) => return Err(e),
                }
                sequence = sequence.max(file.sequence);
            }
            self.update_index_info(folder, peer.device_id(), None, None, Some(sequence))?
        };

        info!(
            folder = %folder,
            records = update.files.len(),
            acquired = new_records.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "processed index records"
        );

        let folder_info = self
            .folder_info(folder)
            .unwrap_or_else(|| FolderInfo::new(folder.as_str(), None));
        if !new_records.is_empty() {
            self.record_listeners.emit(&IndexRecordsAcquired {
                folder: folder_info.clone(),
                records: new_records,
                index_info: index_info.clone(),
            });
        }
        debug!(info = ?index_info, "index info");
        if self.is_remote_index_acquired(peer)? {
            debug!(peer = %peer.device_id(), "index acquired");
            self.full_index_listeners.emit(&FullIndexAcquired { folder: folder_info });
        }
        Ok(())
    }

    /// Converts a wire record and merges it. Returns the stored record, or
    /// `None` when it was discarded (older than the local one, or of a type
    /// we do not handle).
    pub fn push_record(&self, folder: &str, wire: &bep::FileInfo) -> Result<Option<FileInfo>, IndexError> {
        let last_modified = millis_from_parts(wire.modified_s, wire.modified_ns);
        let versions: Vec<Version> = wire
            .version
            .as_ref()
            .map(|v| v.counters.iter().map(|c| Version::new(c.id, c.value)).collect())
            .unwrap_or_default();

        let (record, blocks) = match FileInfoType::try_from(wire.r#type) {
            Ok(FileInfoType::File) => {
                let blocks = FileBlocks::new(
                    folder,
                    wire.name.as_str(),
                    wire.blocks
                        .iter()
                        .map(|b| BlockInfo::new(b.offset as u64, b.size as u32, hex::encode(&b.hash)))
                        .collect(),
                );
                let record = FileInfo::file(folder, wire.name.as_str(), wire.size.max(0) as u64, blocks.hash(), last_modified)?
                    .with_versions(versions)
                    .with_deleted(wire.deleted);
                // tombstones carry no content
                let blocks = (!wire.deleted).then_some(blocks);
                (record, blocks)
            }
            Ok(FileInfoType::Directory) => (
                FileInfo::directory(folder, wire.name.as_str(), last_modified)
                    .with_versions(versions)
                    .with_deleted(wire.deleted),
                None,
            ),
            _ => {
                warn!(folder = %folder, path = %wire.name, file_type = wire.r#type, "unsupported file type, discarding file info");
                return Ok(None);
            }
        };
        self.add_record(record, blocks)
    }

    fn add_record(&self, record: FileInfo, blocks: Option<FileBlocks>) -> Result<Option<FileInfo>, IndexError> {
        let _guard = self.write_lock.lock();
        if let Some(last_modified) = self
            .repository
            .find_file_info_last_modified(&record.folder, &record.path)?
        {
            if record.last_modified <= last_modified {
                trace!(record = %record, "discarding record, modified before local record");
                return Ok(None);
            }
        }

        let stats = self.repository.update_file_info(&record, blocks.as_ref())?;
        trace!(record = %record, "loaded new record");
        self.change_listeners.emit(&IndexChange {
            folder: record.folder.clone(),
            record: record.clone(),
            stats,
        });
        Ok(Some(record))
    }

    /// Looks up a record, deleted or not.
    pub fn get_file_info_by_path(&self, folder: &str, path: &str) -> Result<Option<FileInfo>, IndexError> {
        Ok(self.repository.find_file_info(folder, path)?)
    }

    /// Looks up a file record with its blocks, checking that both agree.
    pub fn get_file_info_and_blocks_by_path(
        &self,
        folder: &str,
        path: &str,
    ) -> Result<Option<(FileInfo, FileBlocks)>, IndexError> {
        let Some(file_info) = self.get_file_info_by_path(folder, path)? else {
            return Ok(None);
        };
        if !file_info.is_file() {
            return Err(IndexError::InvalidRecord(format!("{folder}:{path} is not a file")));
        }
        let blocks = self
            .repository
            .find_file_blocks(folder, path)?
            .ok_or_else(|| IndexError::NotFound(format!("file blocks for {folder}:{path}")))?;
        check_blocks(&file_info, &blocks)?;
        Ok(Some((file_info, blocks)))
    }

    /// Registers a callback for newly merged records.
    pub fn on_index_records_acquired<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&IndexRecordsAcquired) + Send + Sync + 'static,
    {
        self.record_listeners.register(callback)
    }

    /// Registers a callback for completed peer indexes.
    pub fn on_full_index_acquired<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&FullIndexAcquired) + Send + Sync + 'static,
    {
        self.full_index_listeners.register(callback)
    }

    /// Registers a callback for every stored record.
    pub fn on_index_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&IndexChange) + Send + Sync + 'static,
    {
        self.change_listeners.register(callback)
    }

    /// Removes a callback registered with any of the `on_*` methods.
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        self.record_listeners.unregister(id)
            || self.full_index_listeners.unregister(id)
            || self.change_listeners.unregister(id)
    }

    /// Opens a directory browser on `folder`.
    pub fn new_index_browser(self: &Arc<Self>, folder: &str, options: BrowserOptions) -> Result<IndexBrowser, IndexError> {
        IndexBrowser::open(self.clone(), folder, options)
    }

    /// Opens a browser over known folders and their stats.
    pub fn new_folder_browser(self: &Arc<Self>) -> Result<FolderBrowser, IndexError> {
        FolderBrowser::open(self.clone())
    }

    /// Stops the batch worker after the queued batches are processed.
    pub fn close(&self) {
        let listeners = self.record_listeners.len() + self.full_index_listeners.len() + self.change_listeners.len();
        if listeners > 0 {
            debug!(listeners, "closing index handler with registered listeners");
        }
        self.queue.stop();
    }
}

impl Drop for IndexHandler {
    fn drop(&mut self) {
        self.queue.stop();
    }
}
