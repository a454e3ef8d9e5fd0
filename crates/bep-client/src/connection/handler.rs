//! The per-peer connection engine.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bep_core::{Configuration, DeviceAddress, DeviceId, FolderInfo, CLIENT_NAME, CLIENT_VERSION};
use bep_index::{IndexHandler, IndexPeer};
use bep_net::{ConnectionId, ConnectionState, ConnectionStats, StatsSnapshot, TlsSocket, TlsWriter, Transport};
use bep_proto::bep::{self, ClusterConfig, ErrorCode, Hello, Index, Ping, Request, Response};
use bep_proto::framing::{encode_frame, read_frame, read_hello, write_hello};
use bep_proto::Message;
use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use super::cluster::{device_entry, folder_entry, ClusterConfigInfo};
use super::ConnectionObserver;
use crate::executor::{Periodic, WorkerPool, SHUTDOWN_TIMEOUT};
use crate::transfer::{BlockPuller, BlockPusher};
use crate::ClientError;

/// Worker threads dispatching requests and responses.
pub const DISPATCH_THREADS: usize = 4;

type ResponseCallback = Box<dyn FnOnce(Result<Response, ClientError>) + Send>;

/// Serves block requests received on a connection.
pub trait RequestSource: Send + Sync {
    /// Returns a response if this source serves the requested file.
    fn serve(&self, request: &Request) -> Option<Response>;

    /// Called once the response produced by `serve` was written, or failed.
    fn on_sent(&self, _request: &Request, _result: Result<(), ClientError>) {}

    /// Called once when the connection closes while the source is registered.
    fn on_closed(&self) {}
}

/// Completion of a queued frame.
#[derive(Clone)]
pub struct PendingWrite {
    outcome: Arc<(Mutex<Option<Result<(), String>>>, Condvar)>,
}

impl PendingWrite {
    fn new() -> Self {
        Self {
            outcome: Arc::new((Mutex::new(None), Condvar::new())),
        }
    }

    fn complete(&self, result: Result<(), String>) {
        let (lock, cvar) = &*self.outcome;
        *lock.lock() = Some(result);
        cvar.notify_all();
    }

    /// Returns true once the frame was written or failed.
    pub fn is_done(&self) -> bool {
        self.outcome.0.lock().is_some()
    }

    /// Outcome of the write, if finished.
    pub fn result(&self) -> Option<Result<(), ClientError>> {
        self.outcome.0.lock().clone().map(|r| r.map_err(ClientError::SendFailed))
    }

    /// Blocks until the frame is written.
    pub fn wait(&self) -> Result<(), ClientError> {
        let (lock, cvar) = &*self.outcome;
        let mut outcome = lock.lock();
        loop {
            if let Some(result) = outcome.clone() {
                return result.map_err(ClientError::SendFailed);
            }
            cvar.wait(&mut outcome);
        }
    }

    /// Blocks until the frame is written or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<(), ClientError> {
        let deadline = Instant::now() + timeout;
        let (lock, cvar) = &*self.outcome;
        let mut outcome = lock.lock();
        loop {
            if let Some(result) = outcome.clone() {
                return result.map_err(ClientError::SendFailed);
            }
            if cvar.wait_until(&mut outcome, deadline).timed_out() {
                return Err(ClientError::Timeout("frame not written".into()));
            }
        }
    }
}

impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWrite").field("done", &self.is_done()).finish()
    }
}

/// Reader wrapper counting the bytes of each frame.
struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

impl<R> CountingReader<R> {
    fn take_count(&mut self) -> u64 {
        std::mem::take(&mut self.count)
    }
}

/// Socket and executors that exist once the transport is open.
struct Link {
    socket: TlsSocket,
    writer: Arc<Mutex<TlsWriter>>,
    write_executor: WorkerPool,
    dispatch: WorkerPool,
}

struct Lifecycle {
    state: ConnectionState,
    cluster_config_processed: bool,
}

/// One connection to a peer device.
///
/// Owns the TLS socket, a writer thread, a reader thread, a dispatch pool
/// for block traffic and a ping task. Index messages and the cluster config
/// are handled on the reader thread so they keep their arrival order.
///
/// A handler is used once: after `close` a new one must be created.
pub struct ConnectionHandler {
    id: ConnectionId,
    config: Arc<Configuration>,
    transport: Transport,
    address: DeviceAddress,
    local_device_id: DeviceId,
    index_handler: Arc<IndexHandler>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    closing: AtomicBool,
    link: RwLock<Option<Arc<Link>>>,
    ping: Mutex<Option<Periodic>>,
    cluster: RwLock<Option<ClusterConfigInfo>>,
    peer_name: RwLock<Option<String>>,
    stats: ConnectionStats,
    responses: Mutex<HashMap<i32, ResponseCallback>>,
    sources: RwLock<Vec<(u64, Arc<dyn RequestSource>)>>,
    next_source_id: AtomicU64,
    weak_self: Weak<ConnectionHandler>,
}

impl ConnectionHandler {
    /// Creates a handler for `address`. Nothing is opened until `connect`.
    pub fn new(
        config: Arc<Configuration>,
        transport: Transport,
        address: DeviceAddress,
        index_handler: Arc<IndexHandler>,
        observer: Option<Arc<dyn ConnectionObserver>>,
    ) -> Arc<Self> {
        let local_device_id = transport.keystore().device_id();
        Arc::new_cyclic(|weak| Self {
            id: ConnectionId::new(),
            config,
            transport,
            address,
            local_device_id,
            index_handler,
            observer,
            lifecycle: Mutex::new(Lifecycle {
                state: ConnectionState::Disconnected,
                cluster_config_processed: false,
            }),
            lifecycle_changed: Condvar::new(),
            closing: AtomicBool::new(false),
            link: RwLock::new(None),
            ping: Mutex::new(None),
            cluster: RwLock::new(None),
            peer_name: RwLock::new(None),
            stats: ConnectionStats::new(),
            responses: Mutex::new(HashMap::new()),
            sources: RwLock::new(Vec::new()),
            next_source_id: AtomicU64::new(1),
            weak_self: weak.clone(),
        })
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Address this connection was opened to.
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    /// Remote device.
    pub fn device_id(&self) -> DeviceId {
        self.address.device_id
    }

    /// Name the peer announced in its Hello.
    pub fn peer_name(&self) -> Option<String> {
        self.peer_name.read().clone()
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.lock().state
    }

    /// True once the handshake completed and until close.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// True after close.
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Folder sharing announced by the peer, once received.
    pub fn cluster_config_info(&self) -> Option<ClusterConfigInfo> {
        self.cluster.read().clone()
    }

    /// True if the peer shares `folder` with us.
    pub fn has_folder(&self, folder: &str) -> bool {
        self.cluster.read().as_ref().is_some_and(|c| c.is_shared(folder))
    }

    /// Traffic counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Index engine this connection feeds.
    pub fn index_handler(&self) -> &Arc<IndexHandler> {
        &self.index_handler
    }

    /// Downloads files over this connection.
    pub fn block_puller(self: &Arc<Self>) -> BlockPuller {
        BlockPuller::new(self.clone(), self.index_handler.clone())
    }

    /// Uploads files over this connection.
    pub fn block_pusher(self: &Arc<Self>) -> BlockPusher {
        BlockPusher::new(self.clone(), self.index_handler.clone(), self.local_device_id)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state.is_closed() {
            return;
        }
        debug!(connection = %self.id, from = ?lifecycle.state, to = ?state, "state change");
        lifecycle.state = state;
        self.lifecycle_changed.notify_all();
    }

    /// Opens the transport and runs the handshake.
    ///
    /// Returns once the peer's cluster config has been processed. Fails on
    /// identity mismatch, I/O errors or when no cluster config arrives within
    /// the configured timeout; the connection is closed in every failure case.
    pub fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConnectionState::Disconnected {
                return Err(ClientError::Protocol(format!(
                    "connection {} cannot connect in state {:?}",
                    self.id, lifecycle.state
                )));
            }
            lifecycle.state = ConnectionState::Handshaking;
        }
        info!(connection = %self.id, peer = %self.address.device_id, address = %self.address.address, "connecting");

        let result = self.run_handshake().and_then(|()| {
            if self.closing.load(Ordering::SeqCst) {
                Err(ClientError::Closed)
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => {
                self.stats.set_connected();
                self.set_state(ConnectionState::Connected);
                info!(connection = %self.id, peer = %self.address.device_id, "connected");
                self.notify_observer();
                Ok(())
            }
            Err(e) => {
                error!(connection = %self.id, peer = %self.address.device_id, error = %e, "connection failed");
                self.close();
                Err(e)
            }
        }
    }

    fn run_handshake(self: &Arc<Self>) -> Result<(), ClientError> {
        let socket = self.transport.open(&self.address)?;
        if socket.peer_device_id() != self.address.device_id {
            socket.shutdown();
            return Err(ClientError::Protocol(format!(
                "expected device {}, got {}",
                self.address.device_id,
                socket.peer_device_id()
            )));
        }

        let mut writer = socket.writer();
        let mut reader = socket.reader();
        write_hello(
            &mut writer,
            &Hello {
                device_name: self.config.local_device_name(),
                client_name: CLIENT_NAME.to_string(),
                client_version: CLIENT_VERSION.to_string(),
            },
        )?;
        let hello = read_hello(&mut reader)?;
        socket.set_read_timeout(None)?;
        info!(
            connection = %self.id,
            name = %hello.device_name,
            client = %hello.client_name,
            version = %hello.client_version,
            "received hello"
        );
        self.config.update_peer_name(&self.address.device_id, &hello.device_name);
        if let Err(e) = self.config.persist() {
            warn!(error = %e, "cannot persist peer name");
        }
        *self.peer_name.write() = Some(hello.device_name);

        let link = Arc::new(Link {
            socket: socket.clone(),
            writer: Arc::new(Mutex::new(writer)),
            write_executor: WorkerPool::new(&format!("bep-writer-{}", self.id.0), 1)?,
            dispatch: WorkerPool::new(&format!("bep-dispatch-{}", self.id.0), DISPATCH_THREADS)?,
        });
        *self.link.write() = Some(link);
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }

        self.send_message(self.build_cluster_config()?)?.wait()?;
        self.set_state(ConnectionState::AwaitingClusterConfig);
        self.start_reader(reader)?;
        self.wait_for_cluster_config()?;

        for folder in self.shared_folders() {
            debug!(connection = %self.id, folder = %folder, "sending empty index");
            self.send_message(Index {
                folder,
                files: Vec::new(),
            })?;
        }

        let weak = self.weak_self.clone();
        let ping = Periodic::start(&format!("bep-ping-{}", self.id.0), self.config.ping_interval(), move || {
            if let Some(handler) = weak.upgrade() {
                if let Err(e) = handler.send_message(Ping {}) {
                    debug!(connection = %handler.id, error = %e, "ping not sent");
                }
            }
        })?;
        *self.ping.lock() = Some(ping);
        Ok(())
    }

    fn build_cluster_config(&self) -> Result<ClusterConfig, ClientError> {
        let sequencer = self.index_handler.sequencer();
        let local_name = self.config.local_device_name();
        let peer = self.address.device_id;
        let peer_name = self.config.peer(&peer).map(|p| p.name).unwrap_or_default();

        let mut folders = Vec::new();
        for folder in self.config.folders() {
            let mut devices = vec![device_entry(
                &self.local_device_id,
                &local_name,
                sequencer.index_id()?,
                sequencer.current_sequence()?,
            )];
            let (index_id, max_sequence) = match self.index_handler.index_info(&peer, &folder.folder_id)? {
                Some(info) => (info.index_id, info.local_sequence),
                None => (0, 0),
            };
            devices.push(device_entry(&peer, &peer_name, index_id, max_sequence));
            folders.push(folder_entry(&folder, devices));
        }
        debug!(connection = %self.id, folders = folders.len(), "sending cluster config");
        Ok(ClusterConfig { folders })
    }

    fn wait_for_cluster_config(&self) -> Result<(), ClientError> {
        let timeout = self.config.cluster_config_timeout();
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.lifecycle.lock();
        loop {
            if lifecycle.cluster_config_processed {
                return Ok(());
            }
            if lifecycle.state.is_closed() || self.closing.load(Ordering::SeqCst) {
                return Err(ClientError::Protocol("connection closed before cluster config".into()));
            }
            if self.lifecycle_changed.wait_until(&mut lifecycle, deadline).timed_out() {
                if lifecycle.cluster_config_processed {
                    return Ok(());
                }
                return Err(ClientError::Timeout(format!(
                    "no cluster config from {} within {timeout:?}",
                    self.address.device_id
                )));
            }
        }
    }

    fn start_reader(self: &Arc<Self>, reader: bep_net::TlsReader) -> Result<(), ClientError> {
        let weak = self.weak_self.clone();
        let id = self.id;
        thread::Builder::new()
            .name(format!("bep-reader-{}", id.0))
            .spawn(move || {
                let mut reader = CountingReader { inner: reader, count: 0 };
                loop {
                    let result = read_frame(&mut reader);
                    let Some(handler) = weak.upgrade() else {
                        break;
                    };
                    match result {
                        Ok(message) => {
                            handler.stats.record_received(reader.take_count());
                            if !handler.handle_message(message) {
                                break;
                            }
                        }
                        Err(e) => {
                            if !handler.closing.load(Ordering::SeqCst) {
                                if e.is_eof() {
                                    info!(connection = %id, "peer closed the connection");
                                } else {
                                    error!(connection = %id, error = %e, "read failed");
                                }
                                handler.close();
                            }
                            break;
                        }
                    }
                }
                debug!(connection = %id, "reader stopped");
            })?;
        Ok(())
    }

    /// Handles one received message. Returns false when reading must stop.
    fn handle_message(self: &Arc<Self>, message: Message) -> bool {
        trace!(connection = %self.id, message_type = ?message.message_type(), "received message");
        match message {
            Message::ClusterConfig(cluster_config) => {
                if let Err(e) = self.handle_cluster_config(cluster_config) {
                    error!(connection = %self.id, error = %e, "cluster config rejected");
                    self.close();
                    return false;
                }
            }
            Message::Index(Index { folder, files }) => self.handle_index(folder, files),
            Message::IndexUpdate(bep::IndexUpdate { folder, files }) => self.handle_index(folder, files),
            Message::Request(request) => {
                let handler = self.clone();
                self.dispatch(move || handler.serve_request(request));
            }
            Message::Response(response) => {
                let handler = self.clone();
                self.dispatch(move || handler.route_response(response));
            }
            Message::DownloadProgress(_) => debug!(connection = %self.id, "ignoring download progress"),
            Message::Ping(_) => debug!(connection = %self.id, "received ping"),
            Message::Close(close) => {
                info!(connection = %self.id, reason = %close.reason, "peer requested close");
                self.close();
                return false;
            }
        }
        true
    }

    fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let link = self.link.read().clone();
        match link {
            Some(link) => {
                if link.dispatch.execute(task).is_err() {
                    debug!(connection = %self.id, "dropping message after close");
                }
            }
            None => warn!(connection = %self.id, "message before link setup"),
        }
    }

    fn handle_index(self: &Arc<Self>, folder: String, files: Vec<bep::FileInfo>) {
        let peer: Arc<dyn IndexPeer> = self.clone();
        if let Err(e) = self.index_handler.handle_index_message_received_event(&folder, files, peer) {
            error!(connection = %self.id, folder = %folder, error = %e, "cannot queue index message");
        }
    }

    fn handle_cluster_config(&self, message: ClusterConfig) -> Result<(), ClientError> {
        let info = ClusterConfigInfo::from_message(&message, &self.local_device_id, &self.address.device_id);
        {
            let mut cluster = self.cluster.write();
            if cluster.is_some() {
                return Err(ClientError::Protocol("received cluster config twice".into()));
            }
            *cluster = Some(info.clone());
        }

        let mut new_folders: Vec<FolderInfo> = Vec::new();
        for folder in info.folders() {
            debug!(
                connection = %self.id,
                folder = %folder.folder_id,
                announced = folder.is_announced,
                shared = folder.is_shared,
                "cluster config folder"
            );
            if folder.is_shared && self.config.folder(&folder.folder_id).is_none() {
                let folder_info = folder.folder_info();
                self.config.add_folder(folder_info.clone());
                info!(folder = %folder_info, "new folder shared");
                new_folders.push(folder_info);
            }
        }
        if !new_folders.is_empty() {
            if let Err(e) = self.config.persist() {
                warn!(error = %e, "cannot persist shared folders");
            }
            if let Some(observer) = &self.observer {
                for folder in &new_folders {
                    observer.on_new_folder_shared(folder);
                }
            }
        }

        self.index_handler.handle_cluster_config_message_processed_event(&message)?;

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.cluster_config_processed = true;
        self.lifecycle_changed.notify_all();
        Ok(())
    }

    /// Queues a message on the writer thread.
    pub fn send_message(&self, message: impl Into<Message>) -> Result<PendingWrite, ClientError> {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        self.enqueue(message.into())
    }

    fn enqueue(&self, message: Message) -> Result<PendingWrite, ClientError> {
        let link = self
            .link
            .read()
            .clone()
            .ok_or_else(|| ClientError::NotConnected(self.address.device_id.to_string()))?;
        let pending = PendingWrite::new();
        let done = pending.clone();
        let writer = link.writer.clone();
        let handler = self.weak_self.clone();
        let id = self.id;
        link.write_executor.execute(move || {
            let message_type = message.message_type();
            let result = encode_frame(&message).map_err(|e| e.to_string()).and_then(|frame| {
                let mut writer = writer.lock();
                writer.write_all(&frame).and_then(|_| writer.flush()).map_err(|e| e.to_string())?;
                Ok(frame.len())
            });
            match result {
                Ok(len) => {
                    trace!(connection = %id, ?message_type, len, "sent message");
                    if let Some(handler) = handler.upgrade() {
                        handler.stats.record_sent(len as u64);
                    }
                    done.complete(Ok(()));
                }
                Err(e) => {
                    warn!(connection = %id, ?message_type, error = %e, "write failed");
                    done.complete(Err(e));
                }
            }
        })?;
        Ok(pending)
    }

    /// Registers a callback for the response to a new request. Returns the
    /// random non-zero request id to put on the wire.
    pub(crate) fn register_response_callback<F>(&self, callback: F) -> Result<i32, ClientError>
    where
        F: FnOnce(Result<Response, ClientError>) + Send + 'static,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let mut responses = self.responses.lock();
        let mut rng = rand::thread_rng();
        let id = loop {
            let id: i32 = rng.gen();
            if id != 0 && !responses.contains_key(&id) {
                break id;
            }
        };
        responses.insert(id, Box::new(callback));
        Ok(id)
    }

    /// How long a download waits for each block response.
    pub(crate) fn block_request_timeout(&self) -> Duration {
        self.config.block_request_timeout()
    }

    /// Drops the callback of a request. Returns true if it was pending.
    pub(crate) fn cancel_response_callback(&self, id: i32) -> bool {
        self.responses.lock().remove(&id).is_some()
    }

    fn route_response(&self, response: Response) {
        let callback = self.responses.lock().remove(&response.id);
        match callback {
            Some(callback) => callback(Ok(response)),
            None => warn!(connection = %self.id, id = response.id, "received response with unknown id"),
        }
    }

    /// Adds a source of block data for incoming requests.
    pub(crate) fn add_request_source(&self, source: Arc<dyn RequestSource>) -> u64 {
        let id = self.next_source_id.fetch_add(1, Ordering::SeqCst);
        self.sources.write().push((id, source));
        id
    }

    /// Removes a source added with `add_request_source`.
    pub(crate) fn remove_request_source(&self, id: u64) -> bool {
        let mut sources = self.sources.write();
        let before = sources.len();
        sources.retain(|(source_id, _)| *source_id != id);
        before != sources.len()
    }

    fn serve_request(&self, request: Request) {
        debug!(
            connection = %self.id,
            folder = %request.folder,
            path = %request.name,
            offset = request.offset,
            size = request.size,
            "received block request"
        );
        let sources: Vec<Arc<dyn RequestSource>> = self.sources.read().iter().map(|(_, s)| s.clone()).collect();
        let served = sources
            .iter()
            .find_map(|source| source.serve(&request).map(|response| (source.clone(), response)));

        match served {
            Some((source, response)) => {
                let result = self.send_message(response).and_then(|write| write.wait());
                source.on_sent(&request, result);
            }
            None => {
                debug!(connection = %self.id, path = %request.name, "no source for requested file");
                let response = Response {
                    id: request.id,
                    data: Vec::new(),
                    code: ErrorCode::NoSuchFile as i32,
                };
                if let Err(e) = self.send_message(response) {
                    debug!(connection = %self.id, error = %e, "cannot answer request");
                }
            }
        }
    }

    fn notify_observer(&self) {
        if let Some(observer) = &self.observer {
            observer.on_connection_changed(self);
        }
    }

    /// Closes the connection. Idempotent.
    ///
    /// Sends a best-effort CLOSE, stops the ping task, the dispatch pool and
    /// the writer, shuts the socket down and wakes every waiter. Pending
    /// block requests fail with [`ClientError::Closed`] and registered
    /// request sources are released.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(connection = %self.id, peer = %self.address.device_id, "closing connection");

        if let Some(ping) = self.ping.lock().take() {
            ping.stop(SHUTDOWN_TIMEOUT);
        }

        let link = self.link.read().clone();
        if let Some(link) = &link {
            let was_handshaken = self.lifecycle.lock().state >= ConnectionState::AwaitingClusterConfig;
            if was_handshaken {
                if let Err(e) = self.enqueue(Message::from(bep::Close {
                    reason: "closing connection".into(),
                })) {
                    debug!(connection = %self.id, error = %e, "close message not sent");
                }
            }
            link.dispatch.shutdown(SHUTDOWN_TIMEOUT);
            link.write_executor.shutdown(SHUTDOWN_TIMEOUT);
            link.socket.shutdown();
        }

        let pending: Vec<ResponseCallback> = self.responses.lock().drain().map(|(_, c)| c).collect();
        for callback in pending {
            callback(Err(ClientError::Closed));
        }
        let sources: Vec<Arc<dyn RequestSource>> = self.sources.write().drain(..).map(|(_, s)| s).collect();
        for source in sources {
            source.on_closed();
        }

        {
            let mut lifecycle = self.lifecycle.lock();
            lifecycle.state = ConnectionState::Closed;
            self.lifecycle_changed.notify_all();
        }
        self.notify_observer();
        info!(connection = %self.id, stats = ?self.stats.snapshot(), "connection closed");
    }
}

impl IndexPeer for ConnectionHandler {
    fn device_id(&self) -> DeviceId {
        self.address.device_id
    }

    fn shared_folders(&self) -> Vec<String> {
        self.cluster
            .read()
            .as_ref()
            .map(ClusterConfigInfo::shared_folder_ids)
            .unwrap_or_default()
    }

    fn last_active(&self) -> Duration {
        self.stats.idle_time()
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("id", &self.id)
            .field("peer", &self.address.device_id)
            .field("address", &self.address.address)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.id, self.address.device_id.short_id(), self.address.address)
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        if !self.closing.load(Ordering::SeqCst) {
            self.close();
        }
    }
}
