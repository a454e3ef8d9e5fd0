//! Uploads: index updates for new content, directories and deletions.

use std::collections::HashSet;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bep_core::blocks::sha256_hex;
use bep_core::time::parts_from_millis;
use bep_core::{now_millis, BlockList, DeviceId, FileInfo, FileType, Version};
use bep_index::{IndexHandler, ListenerId};
use bep_proto::bep::{self, Counter, ErrorCode, FileInfoType, IndexUpdate, Request, Response, Vector};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandler, PendingWrite, RequestSource};
use crate::ClientError;

/// Announces local changes to a peer and serves the blocks it requests.
pub struct BlockPusher {
    connection: Arc<ConnectionHandler>,
    index_handler: Arc<IndexHandler>,
    local_device_id: DeviceId,
}

impl BlockPusher {
    pub(crate) fn new(
        connection: Arc<ConnectionHandler>,
        index_handler: Arc<IndexHandler>,
        local_device_id: DeviceId,
    ) -> Self {
        Self {
            connection,
            index_handler,
            local_device_id,
        }
    }

    fn require_folder(&self, folder: &str) -> Result<(), ClientError> {
        if self.connection.has_folder(folder) {
            Ok(())
        } else {
            Err(ClientError::Protocol(format!(
                "connection {} does not share folder {folder}",
                self.connection
            )))
        }
    }

    /// Announces a tombstone for an existing entry, keeping its type and
    /// extending its version list.
    pub fn push_delete(&self, folder: &str, path: &str) -> Result<IndexEditObserver, ClientError> {
        self.index_handler
            .wait_for_remote_index_acquired(self.connection.as_ref(), None)?;
        let existing = self
            .index_handler
            .get_file_info_by_path(folder, path)?
            .ok_or_else(|| ClientError::Transfer(format!("{folder}:{path} is not in the index")))?;
        self.require_folder(folder)?;
        let record = bep::FileInfo {
            name: path.to_string(),
            r#type: wire_type(existing.file_type) as i32,
            deleted: true,
            ..Default::default()
        };
        let (write, update) = self.send_index_update(folder, record, &existing.versions)?;
        Ok(IndexEditObserver::new(self.index_handler.clone(), write, update))
    }

    /// Announces a new directory.
    pub fn push_dir(&self, folder: &str, path: &str) -> Result<IndexEditObserver, ClientError> {
        self.require_folder(folder)?;
        let record = bep::FileInfo {
            name: path.to_string(),
            r#type: FileInfoType::Directory as i32,
            ..Default::default()
        };
        let (write, update) = self.send_index_update(folder, record, &[])?;
        Ok(IndexEditObserver::new(self.index_handler.clone(), write, update))
    }

    /// Announces `reader`'s content as `path` and serves its blocks until
    /// the observer is closed.
    ///
    /// The input is buffered completely since requests may ask for any
    /// offset. The upload completes once the peer indexes the new record.
    pub fn push_file<R: Read>(&self, reader: R, folder: &str, path: &str) -> Result<FileUploadObserver, ClientError> {
        self.index_handler
            .wait_for_remote_index_acquired(self.connection.as_ref(), None)?;
        let existing = self.index_handler.get_file_info_by_path(folder, path)?;
        self.require_folder(folder)?;

        let (data, list) = BlockList::read_from(reader)?;
        info!(folder = %folder, path = %path, size = list.size, blocks = list.blocks.len(), "pushing file");
        let upload = Arc::new(Upload {
            folder: folder.to_string(),
            path: path.to_string(),
            hash: list.hash.clone(),
            hashes: list.blocks.iter().map(|b| b.hash.clone()).collect(),
            data,
            state: Mutex::new(UploadState::default()),
            changed: Condvar::new(),
        });

        let source_id = self.connection.add_request_source(upload.clone());
        let watched = upload.clone();
        let listener = self.index_handler.on_index_records_acquired(move |event| {
            if event.folder.folder_id != watched.folder {
                return;
            }
            let echoed = event
                .records
                .iter()
                .any(|r| r.path == watched.path && r.hash.as_deref() == Some(watched.hash.as_str()));
            if echoed {
                watched.mark_completed();
            }
        });

        let record = bep::FileInfo {
            name: path.to_string(),
            r#type: FileInfoType::File as i32,
            size: list.size as i64,
            blocks: list
                .blocks
                .iter()
                .map(|b| bep::BlockInfo {
                    offset: b.offset as i64,
                    size: b.size as i32,
                    hash: b.hash_bytes().unwrap_or_default(),
                    weak_hash: 0,
                })
                .collect(),
            ..Default::default()
        };
        let versions = existing.map(|e| e.versions).unwrap_or_default();
        let update = match self.send_index_update(folder, record, &versions) {
            Ok((_, update)) => update,
            Err(e) => {
                self.index_handler.unregister_listener(listener);
                self.connection.remove_request_source(source_id);
                return Err(e);
            }
        };

        Ok(FileUploadObserver {
            connection: self.connection.clone(),
            index_handler: self.index_handler.clone(),
            upload,
            update,
            source_id,
            listener,
            released: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn send_index_update(
        &self,
        folder: &str,
        mut record: bep::FileInfo,
        old_versions: &[Version],
    ) -> Result<(PendingWrite, IndexUpdate), ClientError> {
        let sequence = self.index_handler.sequencer().next_sequence()?;
        let mut counters: Vec<Counter> = old_versions
            .iter()
            .map(|v| Counter { id: v.id, value: v.value })
            .collect();
        let version = Counter {
            id: self.local_device_id.counter_id(),
            value: sequence as u64,
        };
        debug!(versions = ?old_versions, new = ?version, "appending version");
        counters.push(version);

        let (modified_s, modified_ns) = parts_from_millis(now_millis());
        record.sequence = sequence;
        record.version = Some(Vector { counters });
        record.modified_s = modified_s;
        record.modified_ns = modified_ns;
        record.no_permissions = true;

        let update = IndexUpdate {
            folder: folder.to_string(),
            files: vec![record],
        };
        debug!(folder = %folder, sequence, "sending index update");
        let write = self.connection.send_message(update.clone())?;
        Ok((write, update))
    }
}

fn wire_type(file_type: FileType) -> FileInfoType {
    match file_type {
        FileType::File => FileInfoType::File,
        FileType::Directory => FileInfoType::Directory,
    }
}

#[derive(Default)]
struct UploadState {
    sent: HashSet<String>,
    completed: bool,
    updates: u64,
    error: Option<String>,
}

struct Upload {
    folder: String,
    path: String,
    hash: String,
    hashes: HashSet<String>,
    data: Bytes,
    state: Mutex<UploadState>,
    changed: Condvar,
}

impl Upload {
    fn mark_completed(&self) {
        let mut state = self.state.lock();
        if !state.completed {
            info!(folder = %self.folder, path = %self.path, "upload indexed by peer");
            state.completed = true;
            state.updates += 1;
            self.changed.notify_all();
        }
    }

    fn read_block(&self, request: &Request, hash: &str) -> Option<Bytes> {
        let start = usize::try_from(request.offset).ok()?;
        let end = start.checked_add(usize::try_from(request.size).ok()?)?;
        if end > self.data.len() {
            return None;
        }
        let block = self.data.slice(start..end);
        (sha256_hex(&block) == hash).then_some(block)
    }
}

impl RequestSource for Upload {
    fn serve(&self, request: &Request) -> Option<Response> {
        if request.folder != self.folder || request.name != self.path {
            return None;
        }
        let hash = hex::encode(&request.hash);
        debug!(path = %request.name, offset = request.offset, size = request.size, hash = %hash, "handling block request");
        let response = match self.read_block(request, &hash) {
            Some(block) => Response {
                id: request.id,
                data: block.to_vec(),
                code: ErrorCode::NoError as i32,
            },
            None => {
                warn!(path = %request.name, offset = request.offset, hash = %hash, "requested block does not match upload");
                Response {
                    id: request.id,
                    data: Vec::new(),
                    code: ErrorCode::InvalidFile as i32,
                }
            }
        };
        Some(response)
    }

    fn on_sent(&self, request: &Request, result: Result<(), ClientError>) {
        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                state.sent.insert(hex::encode(&request.hash));
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "block not sent");
                if state.error.is_none() {
                    state.error = Some(e.to_string());
                }
            }
        }
        state.updates += 1;
        self.changed.notify_all();
    }

    fn on_closed(&self) {
        let mut state = self.state.lock();
        if state.completed || state.error.is_some() {
            return;
        }
        warn!(folder = %self.folder, path = %self.path, "connection closed before the upload was indexed");
        state.error = Some("connection closed".into());
        state.updates += 1;
        self.changed.notify_all();
    }
}

/// Progress of one file upload.
pub struct FileUploadObserver {
    connection: Arc<ConnectionHandler>,
    index_handler: Arc<IndexHandler>,
    upload: Arc<Upload>,
    update: IndexUpdate,
    source_id: u64,
    listener: ListenerId,
    released: AtomicBool,
    closed: AtomicBool,
}

impl FileUploadObserver {
    /// Percentage of distinct blocks sent; 100 once the peer indexed the file.
    pub fn progress_percentage(&self) -> u8 {
        let state = self.upload.state.lock();
        if state.completed {
            return 100;
        }
        let total = self.upload.hashes.len();
        if total == 0 {
            return 0;
        }
        let sent = state.sent.intersection(&self.upload.hashes).count();
        (sent * 100 / total).min(100) as u8
    }

    /// True once the peer's index holds the uploaded record.
    pub fn is_completed(&self) -> bool {
        self.upload.state.lock().completed
    }

    /// Blocks until a block is sent, the peer indexes the file or an error
    /// occurs, then returns the percentage. Fails once the connection is
    /// closed before the peer indexed the file.
    pub fn wait_for_progress_update(&self) -> Result<u8, ClientError> {
        {
            let mut state = self.upload.state.lock();
            if !state.completed && state.error.is_none() && self.connection.is_closed() {
                state.error = Some("connection closed".into());
            }
            let seen = state.updates;
            while state.updates == seen && !state.completed && state.error.is_none() {
                self.upload.changed.wait(&mut state);
            }
            if let Some(error) = &state.error {
                return Err(ClientError::Transfer(error.clone()));
            }
        }
        Ok(self.progress_percentage())
    }

    /// Blocks until the peer indexes the file.
    pub fn wait_for_complete(&self) -> Result<&Self, ClientError> {
        while !self.is_completed() {
            self.wait_for_progress_update()?;
        }
        Ok(self)
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.index_handler.unregister_listener(self.listener);
            self.connection.remove_request_source(self.source_id);
        }
    }

    /// Stops serving blocks and stores the sent record in the local index.
    pub fn close(&self) -> Result<Option<FileInfo>, ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        debug!(path = %self.upload.path, "closing upload");
        self.release();
        push_local(&self.index_handler, &self.update)
    }
}

impl Drop for FileUploadObserver {
    fn drop(&mut self) {
        self.release();
    }
}

/// Completion of a directory or deletion announcement.
pub struct IndexEditObserver {
    index_handler: Arc<IndexHandler>,
    write: PendingWrite,
    update: IndexUpdate,
}

impl IndexEditObserver {
    fn new(index_handler: Arc<IndexHandler>, write: PendingWrite, update: IndexUpdate) -> Self {
        Self {
            index_handler,
            write,
            update,
        }
    }

    /// True once the update was written. Re-raises a write failure.
    pub fn is_completed(&self) -> Result<bool, ClientError> {
        match self.write.result() {
            Some(result) => result.map(|()| true),
            None => Ok(false),
        }
    }

    /// Blocks until the update is written.
    pub fn wait_for_complete(&self) -> Result<(), ClientError> {
        self.write.wait()
    }

    /// Stores the sent record in the local index.
    pub fn close(&self) -> Result<Option<FileInfo>, ClientError> {
        push_local(&self.index_handler, &self.update)
    }
}

fn push_local(index_handler: &IndexHandler, update: &IndexUpdate) -> Result<Option<FileInfo>, ClientError> {
    let Some(record) = update.files.first() else {
        return Ok(None);
    };
    let stored = index_handler.push_record(&update.folder, record)?;
    info!(folder = %update.folder, path = %record.name, stored = stored.is_some(), "sent file info record");
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(data: &[u8]) -> Upload {
        let (data, list) = BlockList::read_from(data).unwrap();
        Upload {
            folder: "f".into(),
            path: "a.bin".into(),
            hash: list.hash.clone(),
            hashes: list.blocks.iter().map(|b| b.hash.clone()).collect(),
            data,
            state: Mutex::new(UploadState::default()),
            changed: Condvar::new(),
        }
    }

    #[test]
    fn test_serves_matching_range() {
        let content: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let upload = upload(&content);
        let request = Request {
            id: 7,
            folder: "f".into(),
            name: "a.bin".into(),
            offset: 0,
            size: 1000,
            hash: hex::decode(sha256_hex(&content)).unwrap(),
            from_temporary: false,
        };
        let response = upload.serve(&request).unwrap();
        assert_eq!(response.id, 7);
        assert_eq!(response.code, ErrorCode::NoError as i32);
        assert_eq!(response.data, content);

        let other = Request {
            name: "b.bin".into(),
            ..request.clone()
        };
        assert!(upload.serve(&other).is_none());

        let bad_hash = Request {
            hash: vec![0; 32],
            ..request.clone()
        };
        assert_eq!(upload.serve(&bad_hash).unwrap().code, ErrorCode::InvalidFile as i32);

        let out_of_range = Request {
            offset: 900,
            size: 200,
            ..request
        };
        assert_eq!(upload.serve(&out_of_range).unwrap().code, ErrorCode::InvalidFile as i32);
    }

    #[test]
    fn test_completion_needs_index_echo() {
        let upload = upload(b"hello");
        let request = Request {
            hash: hex::decode(sha256_hex(b"hello")).unwrap(),
            ..Default::default()
        };
        upload.on_sent(&request, Ok(()));
        {
            let state = upload.state.lock();
            assert_eq!(state.sent.len(), 1);
            assert!(!state.completed);
        }
        upload.mark_completed();
        assert!(upload.state.lock().completed);
    }

    #[test]
    fn test_connection_close_fails_pending_upload() {
        let pending = upload(b"hello");
        pending.on_closed();
        {
            let state = pending.state.lock();
            assert_eq!(state.error.as_deref(), Some("connection closed"));
            assert_eq!(state.updates, 1);
        }

        let indexed = upload(b"hello");
        indexed.mark_completed();
        indexed.on_closed();
        let state = indexed.state.lock();
        assert!(state.completed);
        assert!(state.error.is_none());
    }

    #[test]
    fn test_wire_type() {
        assert_eq!(wire_type(FileType::File), FileInfoType::File);
        assert_eq!(wire_type(FileType::Directory), FileInfoType::Directory);
    }
}
