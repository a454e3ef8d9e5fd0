//! Client: identity, index engine and the set of peer connections.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use bep_core::{Configuration, DeviceAddress, DeviceId, DeviceInfo, FileInfo, FolderInfo};
use bep_index::{IndexHandler, ListenerId, Listeners};
use bep_net::{ConnectionId, ConnectionState, Keystore, KeystoreLoader, StatsSnapshot, Transport, TransportConfig};
use bep_store::{IndexRepository, TempRepository};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandler, ConnectionObserver};
use crate::discovery::AddressSupplier;
use crate::executor::{Periodic, SHUTDOWN_TIMEOUT};
use crate::transfer::{FileDownloadObserver, FileUploadObserver, IndexEditObserver};
use crate::ClientError;

/// A connection was established or closed.
#[derive(Debug, Clone)]
pub struct ConnectionChange {
    /// Connection id
    pub connection_id: ConnectionId,
    /// Remote device
    pub device_id: DeviceId,
    /// Address used
    pub address: String,
    /// New state
    pub state: ConnectionState,
}

/// Connection status of a configured peer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    /// Configured peer
    pub device: DeviceInfo,
    /// State of the best connection, `Disconnected` without one
    pub state: ConnectionState,
    /// Address of the connection
    pub address: Option<String>,
    /// Traffic of the connection
    pub stats: Option<StatsSnapshot>,
}

/// Loads the keystore from the configuration, generating and persisting a
/// new one if none exists.
pub fn load_keystore(config: &Configuration) -> Result<Arc<Keystore>, ClientError> {
    let loader = KeystoreLoader::shared();
    if let Some(pem) = config.keystore() {
        let keystore = loader.load(pem.as_bytes())?;
        if config.local_device_id() != Some(keystore.device_id()) {
            config.set_keystore(keystore.device_id(), pem);
            config.persist()?;
        }
        return Ok(keystore);
    }

    let (keystore, pem) = loader.generate()?;
    info!(device_id = %keystore.device_id(), "generated new keystore");
    config.set_keystore(keystore.device_id(), pem);
    config.persist()?;
    Ok(keystore)
}

type ConnectionKey = (i32, ConnectionId);

struct ClientInner {
    config: Arc<Configuration>,
    transport: Transport,
    index_handler: Arc<IndexHandler>,
    addresses: Arc<dyn AddressSupplier>,
    connections: RwLock<BTreeMap<ConnectionKey, Arc<ConnectionHandler>>>,
    handshake_locks: Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    change_listeners: Listeners<ConnectionChange>,
    closed: AtomicBool,
    weak_self: Weak<ClientInner>,
}

/// Forwards connection notifications to the client without keeping it alive.
struct ClientObserver(Weak<ClientInner>);

impl ConnectionObserver for ClientObserver {
    fn on_connection_changed(&self, connection: &ConnectionHandler) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if connection.is_closed() {
            let removed: Vec<Arc<ConnectionHandler>> = {
                let mut connections = inner.connections.write();
                let keys: Vec<ConnectionKey> = connections
                    .keys()
                    .filter(|(_, id)| *id == connection.id())
                    .copied()
                    .collect();
                keys.iter().filter_map(|key| connections.remove(key)).collect()
            };
            debug!(connection = %connection.id(), removed = removed.len(), "connection released");
        }
        inner.change_listeners.emit(&ConnectionChange {
            connection_id: connection.id(),
            device_id: connection.device_id(),
            address: connection.address().address.clone(),
            state: connection.state(),
        });
    }

    fn on_new_folder_shared(&self, folder: &FolderInfo) {
        info!(folder = %folder, "peer shared a new folder");
    }
}

impl ClientInner {
    fn handshake_lock(&self, device_id: &DeviceId) -> Arc<Mutex<()>> {
        self.handshake_locks.lock().entry(*device_id).or_default().clone()
    }

    fn find_connected(&self, device_id: &DeviceId) -> Option<Arc<ConnectionHandler>> {
        self.connections
            .read()
            .values()
            .find(|c| &c.device_id() == device_id && c.is_connected())
            .cloned()
    }

    /// Opens a connection. The caller holds the device's handshake lock.
    fn open_locked(&self, address: &DeviceAddress) -> Result<Arc<ConnectionHandler>, ClientError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        let observer: Arc<dyn ConnectionObserver> = Arc::new(ClientObserver(self.weak_self.clone()));
        let connection = ConnectionHandler::new(
            self.config.clone(),
            self.transport.clone(),
            address.clone(),
            self.index_handler.clone(),
            Some(observer),
        );
        // registered before the handshake so a close during `connect` finds it
        let key = (address.score, connection.id());
        self.connections.write().insert(key, connection.clone());
        match connection.connect() {
            Ok(()) => {
                self.addresses.report(address, true);
                Ok(connection)
            }
            Err(e) => {
                self.connections.write().remove(&key);
                self.addresses.report(address, false);
                Err(e)
            }
        }
    }

    fn open_connection(&self, address: &DeviceAddress) -> Result<Arc<ConnectionHandler>, ClientError> {
        let lock = self.handshake_lock(&address.device_id);
        let _guard = lock.lock();
        self.open_locked(address)
    }

    fn connection_for_device(&self, device_id: &DeviceId) -> Result<Arc<ConnectionHandler>, ClientError> {
        if let Some(connection) = self.find_connected(device_id) {
            return Ok(connection);
        }
        let lock = self.handshake_lock(device_id);
        let _guard = lock.lock();
        if let Some(connection) = self.find_connected(device_id) {
            return Ok(connection);
        }

        for address in self.addresses.addresses(device_id) {
            match self.open_locked(&address) {
                Ok(connection) => return Ok(connection),
                Err(e) => warn!(device = %device_id, address = %address.address, error = %e, "connection attempt failed"),
            }
        }
        Err(ClientError::NotConnected(device_id.to_string()))
    }

    fn get_peer_connections(&self) -> Vec<Arc<ConnectionHandler>> {
        let peers = self.config.peer_ids();
        thread::scope(|scope| {
            let attempts: Vec<_> = peers
                .iter()
                .map(|device_id| scope.spawn(move || self.connection_for_device(device_id)))
                .collect();
            attempts
                .into_iter()
                .filter_map(|attempt| attempt.join().ok())
                .filter_map(|result| match result {
                    Ok(connection) => Some(connection),
                    Err(e) => {
                        debug!(error = %e, "peer unavailable");
                        None
                    }
                })
                .collect()
        })
    }

    fn update_index_from_peers(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        for connection in self.get_peer_connections() {
            match self
                .index_handler
                .wait_for_remote_index_acquired(connection.as_ref(), None)
            {
                Ok(()) => debug!(connection = %connection, "index up to date"),
                Err(e) => warn!(connection = %connection, error = %e, "index not acquired"),
            }
        }
    }

    fn connection_for_folder(&self, folder: &str) -> Result<Arc<ConnectionHandler>, ClientError> {
        self.get_peer_connections()
            .into_iter()
            .find(|c| c.has_folder(folder))
            .ok_or_else(|| ClientError::NoConnection(folder.to_string()))
    }

    fn take_connections<F>(&self, predicate: F) -> Vec<Arc<ConnectionHandler>>
    where
        F: Fn(&ConnectionHandler) -> bool,
    {
        let mut connections = self.connections.write();
        let keys: Vec<ConnectionKey> = connections
            .iter()
            .filter(|(_, c)| predicate(c))
            .map(|(key, _)| *key)
            .collect();
        keys.iter().filter_map(|key| connections.remove(key)).collect()
    }
}

/// A BEP client: one local identity, one index engine and connections to
/// the configured peers.
///
/// Peers are reached through the addresses of an [`AddressSupplier`]. At
/// most one handshake per device runs at a time, and an established
/// connection is reused until it closes. The index is refreshed from all
/// peers periodically.
pub struct BepClient {
    inner: Arc<ClientInner>,
    refresh: Mutex<Option<Periodic>>,
}

impl BepClient {
    /// Creates the client and starts the periodic index refresh.
    pub fn new(
        config: Arc<Configuration>,
        repository: Arc<dyn IndexRepository>,
        temp: Arc<dyn TempRepository>,
        addresses: Arc<dyn AddressSupplier>,
    ) -> Result<Self, ClientError> {
        let keystore = load_keystore(&config)?;
        info!(device_id = %keystore.device_id(), name = %config.local_device_name(), "starting client");
        let index_handler = IndexHandler::new(config.clone(), repository, temp);
        let interval = config.index_update_interval();
        let transport = Transport::with_config(
            keystore,
            TransportConfig {
                handshake_timeout: config.cluster_config_timeout(),
                ..TransportConfig::default()
            },
        );

        let inner = Arc::new_cyclic(|weak| ClientInner {
            config,
            transport,
            index_handler,
            addresses,
            connections: RwLock::new(BTreeMap::new()),
            handshake_locks: Mutex::new(HashMap::new()),
            change_listeners: Listeners::new(),
            closed: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&inner);
        let refresh = Periodic::start("bep-index-refresh", interval, move || {
            if let Some(inner) = weak.upgrade() {
                inner.update_index_from_peers();
            }
        })?;

        Ok(Self {
            inner,
            refresh: Mutex::new(Some(refresh)),
        })
    }

    /// Local device id.
    pub fn device_id(&self) -> DeviceId {
        self.inner.transport.keystore().device_id()
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<Configuration> {
        &self.inner.config
    }

    /// Index engine.
    pub fn index_handler(&self) -> &Arc<IndexHandler> {
        &self.inner.index_handler
    }

    /// Connects to one address.
    pub fn connect_to(&self, address: &DeviceAddress) -> Result<Arc<ConnectionHandler>, ClientError> {
        self.inner.open_connection(address)
    }

    /// Returns a connection to `device_id`, reusing an established one.
    pub fn connection_for_device(&self, device_id: &DeviceId) -> Result<Arc<ConnectionHandler>, ClientError> {
        self.inner.connection_for_device(device_id)
    }

    /// Connects to every configured peer that can be reached.
    pub fn get_peer_connections(&self) -> Vec<Arc<ConnectionHandler>> {
        self.inner.get_peer_connections()
    }

    /// Current connections, including ones still handshaking, best address
    /// first.
    pub fn connections(&self) -> Vec<Arc<ConnectionHandler>> {
        self.inner.connections.read().values().cloned().collect()
    }

    /// Connects to all peers and waits for their indexes.
    pub fn update_index_from_peers(&self) {
        self.inner.update_index_from_peers();
    }

    /// Downloads a file from a peer sharing its folder.
    pub fn pull_file(&self, file_info: &FileInfo) -> Result<FileDownloadObserver, ClientError> {
        self.inner
            .connection_for_folder(&file_info.folder)?
            .block_puller()
            .pull_file(file_info)
    }

    /// Uploads `reader` as `path` to a peer sharing `folder`.
    pub fn push_file<R: Read>(&self, reader: R, folder: &str, path: &str) -> Result<FileUploadObserver, ClientError> {
        self.inner
            .connection_for_folder(folder)?
            .block_pusher()
            .push_file(reader, folder, path)
    }

    /// Announces a new directory to a peer sharing `folder`.
    pub fn push_dir(&self, folder: &str, path: &str) -> Result<IndexEditObserver, ClientError> {
        self.inner.connection_for_folder(folder)?.block_pusher().push_dir(folder, path)
    }

    /// Announces a deletion to a peer sharing `folder`.
    pub fn push_delete(&self, folder: &str, path: &str) -> Result<IndexEditObserver, ClientError> {
        self.inner
            .connection_for_folder(folder)?
            .block_pusher()
            .push_delete(folder, path)
    }

    /// Status of every configured peer.
    pub fn peer_status(&self) -> Vec<PeerStatus> {
        let connections = self.connections();
        self.inner
            .config
            .peers()
            .into_iter()
            .map(|device| {
                let connection = connections
                    .iter()
                    .filter(|c| c.device_id() == device.device_id)
                    .max_by_key(|c| c.state());
                PeerStatus {
                    state: connection.map_or(ConnectionState::Disconnected, |c| c.state()),
                    address: connection.map(|c| c.address().address.clone()),
                    stats: connection.map(|c| c.stats()),
                    device,
                }
            })
            .collect()
    }

    /// Closes all connections to `device_id`. Returns how many were closed.
    pub fn disconnect(&self, device_id: &DeviceId) -> usize {
        let removed = self.inner.take_connections(|c| &c.device_id() == device_id);
        for connection in &removed {
            connection.close();
        }
        info!(device = %device_id, closed = removed.len(), "disconnected");
        removed.len()
    }

    /// Replaces the connections to `device_id` with a new one.
    pub fn reconnect(&self, device_id: &DeviceId) -> Result<Arc<ConnectionHandler>, ClientError> {
        self.disconnect(device_id);
        self.inner.connection_for_device(device_id)
    }

    /// Registers a callback for connection state changes.
    pub fn subscribe_connection_changes<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ConnectionChange) + Send + Sync + 'static,
    {
        self.inner.change_listeners.register(callback)
    }

    /// Removes a callback registered with `subscribe_connection_changes`.
    pub fn unsubscribe_connection_changes(&self, id: ListenerId) -> bool {
        self.inner.change_listeners.unregister(id)
    }

    /// Stops the refresh task, closes every connection and the index
    /// engine. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing client");
        if let Some(refresh) = self.refresh.lock().take() {
            refresh.stop(SHUTDOWN_TIMEOUT);
        }
        for connection in self.inner.take_connections(|_| true) {
            connection.close();
        }
        self.inner.index_handler.close();
    }
}

impl Drop for BepClient {
    fn drop(&mut self) {
        self.close();
    }
}
