//! Block downloads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bep_core::blocks::sha256_hex;
use bep_core::{describe_size, BlockInfo, FileBlocks, FileInfo, BLOCK_SIZE};
use bep_index::IndexHandler;
use bep_proto::bep::{ErrorCode, Request, Response};
use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandler;
use crate::ClientError;

/// Block requests kept in flight per download.
pub const MAX_PENDING_REQUESTS: usize = 4;

/// Downloads files announced in a peer's index.
pub struct BlockPuller {
    connection: Arc<ConnectionHandler>,
    index_handler: Arc<IndexHandler>,
}

impl BlockPuller {
    pub(crate) fn new(connection: Arc<ConnectionHandler>, index_handler: Arc<IndexHandler>) -> Self {
        Self {
            connection,
            index_handler,
        }
    }

    /// Starts downloading `file_info`.
    ///
    /// Waits for the peer's index, then requests every distinct block of the
    /// file. The index must know the file with blocks matching
    /// `file_info.hash`, and the peer must share its folder.
    pub fn pull_file(&self, file_info: &FileInfo) -> Result<FileDownloadObserver, ClientError> {
        self.index_handler
            .wait_for_remote_index_acquired(self.connection.as_ref(), None)?;
        let (_, file_blocks) = self
            .index_handler
            .get_file_info_and_blocks_by_path(&file_info.folder, &file_info.path)?
            .ok_or_else(|| {
                ClientError::Transfer(format!(
                    "file not found in local index for folder = {} path = {}",
                    file_info.folder, file_info.path
                ))
            })?;
        if !self.connection.has_folder(file_blocks.folder()) {
            return Err(ClientError::Protocol(format!(
                "connection {} does not share folder {}",
                self.connection,
                file_blocks.folder()
            )));
        }
        if file_info.hash.as_deref() != Some(file_blocks.hash()) {
            return Err(ClientError::Transfer(format!(
                "{}:{} changed since it was listed",
                file_info.folder, file_info.path
            )));
        }
        info!(file = %file_info, blocks = file_blocks.blocks().len(), "pulling file");

        let mut queue = VecDeque::new();
        let mut missing = HashSet::new();
        for block in file_blocks.blocks() {
            if missing.insert(block.hash.clone()) {
                queue.push_back(block.clone());
            }
        }

        let download = Arc::new(Download {
            connection: self.connection.clone(),
            request_timeout: self.connection.block_request_timeout(),
            file_info: file_info.clone(),
            file_blocks,
            state: Mutex::new(DownloadState {
                missing,
                queue,
                ..Default::default()
            }),
            changed: Condvar::new(),
        });
        for _ in 0..MAX_PENDING_REQUESTS {
            Download::request_next(&download);
        }
        Ok(FileDownloadObserver {
            download,
            closed: AtomicBool::new(false),
        })
    }
}

#[derive(Default)]
struct DownloadState {
    received: HashMap<String, Bytes>,
    missing: HashSet<String>,
    queue: VecDeque<BlockInfo>,
    // request id -> (registered at, block hash)
    in_flight: HashMap<i32, (Instant, String)>,
    received_bytes: u64,
    updates: u64,
    error: Option<String>,
    cancelled: bool,
}

impl DownloadState {
    fn is_completed(&self) -> bool {
        self.missing.is_empty()
    }

    fn progress(&self) -> f64 {
        if self.is_completed() {
            return 1.0;
        }
        let missing = self.missing.len() as u64 * BLOCK_SIZE as u64;
        self.received_bytes as f64 / (self.received_bytes + missing) as f64
    }
}

struct Download {
    connection: Arc<ConnectionHandler>,
    request_timeout: Duration,
    file_info: FileInfo,
    file_blocks: FileBlocks,
    state: Mutex<DownloadState>,
    changed: Condvar,
}

impl Download {
    fn request_next(download: &Arc<Download>) {
        let block = {
            let mut state = download.state.lock();
            if state.error.is_some() || state.cancelled {
                return;
            }
            match state.queue.pop_front() {
                Some(block) => block,
                None => return,
            }
        };

        let Some(hash) = block.hash_bytes() else {
            download.fail(format!("invalid block hash {}", block.hash));
            return;
        };
        let target = download.clone();
        let expected = block.clone();
        // the response callback needs the state lock, so the entry is in place before it can run
        let registered = {
            let mut state = download.state.lock();
            let registered = download
                .connection
                .register_response_callback(move |result| target.on_response(&expected, result));
            if let Ok(id) = registered {
                state.in_flight.insert(id, (Instant::now(), block.hash.clone()));
            }
            registered
        };
        let id = match registered {
            Ok(id) => id,
            Err(e) => {
                download.fail(e.to_string());
                return;
            }
        };

        debug!(id, hash = %block.hash, offset = block.offset, "sent request for block");
        let request = Request {
            id,
            folder: download.file_blocks.folder().to_string(),
            name: download.file_blocks.path().to_string(),
            offset: block.offset as i64,
            size: block.size as i32,
            hash,
            from_temporary: false,
        };
        if let Err(e) = download.connection.send_message(request) {
            download.connection.cancel_response_callback(id);
            download.fail(e.to_string());
        }
    }

    fn on_response(self: &Arc<Self>, block: &BlockInfo, result: Result<Response, ClientError>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => return self.fail(e.to_string()),
        };
        if response.code != ErrorCode::NoError as i32 {
            let code = ErrorCode::try_from(response.code).map_or_else(|_| response.code.to_string(), |c| format!("{c:?}"));
            return self.fail(format!("received error response, code = {code}"));
        }
        let hash = sha256_hex(&response.data);
        if hash != block.hash {
            return self.fail(format!("expected block with hash {}, but got block with hash {hash}", block.hash));
        }

        {
            let mut state = self.state.lock();
            state.in_flight.remove(&response.id);
            if state.cancelled {
                return;
            }
            if state.missing.remove(&block.hash) {
                state.received_bytes += response.data.len() as u64;
                state.received.insert(block.hash.clone(), Bytes::from(response.data));
            }
            state.updates += 1;
            debug!(
                hash = %block.hash,
                progress = state.progress(),
                missing = state.missing.len(),
                "received block"
            );
            if state.is_completed() {
                info!(file = %self.file_info, "all blocks received");
            }
            self.changed.notify_all();
        }
        Download::request_next(self);
    }

    /// Drops requests older than the request timeout and fails the download
    /// if there were any. Returns the dropped request ids.
    fn expire_requests(&self, state: &mut DownloadState) -> Vec<i32> {
        let now = Instant::now();
        let expired: Vec<(i32, String)> = state
            .in_flight
            .iter()
            .filter(|(_, (sent, _))| now.duration_since(*sent) >= self.request_timeout)
            .map(|(id, (_, hash))| (*id, hash.clone()))
            .collect();
        for (id, _) in &expired {
            state.in_flight.remove(id);
        }
        if let Some((_, hash)) = expired.first() {
            if state.error.is_none() {
                let reason = format!("timeout waiting for block {hash} after {:?}", self.request_timeout);
                warn!(file = %self.file_info, error = %reason, "download failed");
                state.error = Some(reason);
            }
            state.updates += 1;
            self.changed.notify_all();
        }
        expired.into_iter().map(|(id, _)| id).collect()
    }

    fn fail(&self, reason: String) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            warn!(file = %self.file_info, error = %reason, "download failed");
            state.error = Some(reason);
        }
        state.updates += 1;
        self.changed.notify_all();
    }
}

/// Progress and result of one download.
///
/// Dropping the observer cancels the download.
pub struct FileDownloadObserver {
    download: Arc<Download>,
    closed: AtomicBool,
}

impl FileDownloadObserver {
    /// Downloaded file.
    pub fn file_info(&self) -> &FileInfo {
        &self.download.file_info
    }

    /// Fraction downloaded in `[0, 1]`; exactly 1.0 once complete.
    ///
    /// Missing blocks count as full-size blocks, so the value slightly
    /// underestimates progress on files whose last block is short.
    pub fn progress(&self) -> f64 {
        self.download.state.lock().progress()
    }

    /// Human readable progress.
    pub fn progress_message(&self) -> String {
        let total = self.download.file_blocks.size();
        let state = self.download.state.lock();
        format!(
            "{:.0}% {}/{}",
            state.progress() * 100.0,
            describe_size(state.received_bytes.min(total)),
            describe_size(total)
        )
    }

    /// True once every block is received.
    pub fn is_completed(&self) -> bool {
        self.download.state.lock().is_completed()
    }

    /// Blocks until the next block arrives or the download ends, then
    /// returns the progress. Re-raises a captured transfer error, and fails
    /// the download when a block request stays unanswered for longer than
    /// the configured block request timeout.
    pub fn wait_for_progress_update(&self) -> Result<f64, ClientError> {
        let download = &self.download;
        let mut expired = Vec::new();
        let result = {
            let mut state = download.state.lock();
            let seen = state.updates;
            while state.updates == seen && !state.is_completed() && state.error.is_none() && !state.cancelled {
                let oldest = state.in_flight.values().map(|(sent, _)| *sent).min();
                match oldest {
                    Some(sent) => {
                        if download
                            .changed
                            .wait_until(&mut state, sent + download.request_timeout)
                            .timed_out()
                        {
                            expired.extend(download.expire_requests(&mut state));
                        }
                    }
                    None => download.changed.wait(&mut state),
                }
            }
            if let Some(error) = &state.error {
                Err(ClientError::Transfer(error.clone()))
            } else if state.cancelled && !state.is_completed() {
                Err(ClientError::Cancelled)
            } else {
                Ok(state.progress())
            }
        };
        for id in expired {
            download.connection.cancel_response_callback(id);
        }
        result
    }

    /// Blocks until the download completes or fails.
    pub fn wait_for_complete(&self) -> Result<&Self, ClientError> {
        while !self.is_completed() {
            self.wait_for_progress_update()?;
        }
        Ok(self)
    }

    /// Stops requesting blocks. Requests already sent still complete.
    pub fn cancel(&self) {
        let mut state = self.download.state.lock();
        if !state.cancelled {
            debug!(file = %self.download.file_info, "download cancelled");
            state.cancelled = true;
            state.queue.clear();
            self.download.changed.notify_all();
        }
    }

    /// Reassembled file content in block order.
    ///
    /// Fails unless every block was received.
    pub fn input_stream(&self) -> Result<BlockStream, ClientError> {
        let state = self.download.state.lock();
        if !state.is_completed() {
            return Err(ClientError::Transfer(format!(
                "{} blocks still missing",
                state.missing.len()
            )));
        }
        let mut blocks = VecDeque::with_capacity(self.download.file_blocks.blocks().len());
        for block in self.download.file_blocks.blocks() {
            let data = state
                .received
                .get(&block.hash)
                .cloned()
                .ok_or_else(|| ClientError::Transfer(format!("block {} not received", block.hash)))?;
            blocks.push_back(data);
        }
        Ok(BlockStream { blocks })
    }

    /// Cancels the download and releases received data. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel();
        let in_flight: Vec<i32> = self.download.state.lock().in_flight.drain().map(|(id, _)| id).collect();
        for id in in_flight {
            self.download.connection.cancel_response_callback(id);
        }
        self.download.state.lock().received.clear();
    }
}

impl Drop for FileDownloadObserver {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reader over downloaded blocks.
pub struct BlockStream {
    blocks: VecDeque<Bytes>,
}

impl Read for BlockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(front) = self.blocks.front_mut() {
            if front.has_remaining() {
                let n = front.remaining().min(buf.len());
                front.copy_to_slice(&mut buf[..n]);
                return Ok(n);
            }
            self.blocks.pop_front();
        }
        Ok(0)
    }
}
