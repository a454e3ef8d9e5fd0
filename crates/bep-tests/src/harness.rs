//! Client fixtures wired to a [`TestPeer`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bep_client::{BepClient, StaticAddressSupplier};
use bep_core::config::{ConfigData, Timeouts};
use bep_core::{Configuration, DeviceInfo, FolderInfo};
use bep_store::MemoryRepository;

use crate::peer::{PeerSession, TestPeer, TestResult};

/// Timeouts short enough for failing tests to end quickly. The periodic
/// index refresh is pushed out of the way.
pub fn test_timeouts() -> Timeouts {
    Timeouts {
        cluster_config_secs: 5,
        index_acquire_secs: 5,
        ping_interval_secs: 60,
        index_update_interval_secs: 3600,
        block_request_secs: 5,
    }
}

/// A client whose only peer is `peer`, with `folders` configured.
pub struct ClientFixture {
    /// Client under test
    pub client: BepClient,
    /// Its configuration
    pub config: Arc<Configuration>,
    /// Index and temp storage
    pub repository: Arc<MemoryRepository>,
}

impl ClientFixture {
    /// Builds an in-memory client configured to reach `peer`.
    pub fn new(peer: &TestPeer, folders: &[&str]) -> TestResult<Self> {
        Self::with_timeouts(peer, folders, test_timeouts())
    }

    /// Same as [`ClientFixture::new`] with explicit timeouts.
    pub fn with_timeouts(peer: &TestPeer, folders: &[&str], timeouts: Timeouts) -> TestResult<Self> {
        let data = ConfigData {
            local_device_name: "client-under-test".to_string(),
            folders: folders.iter().map(|f| FolderInfo::new(*f, None)).collect(),
            peers: vec![DeviceInfo::new(peer.device_id(), Some("unnamed")).with_address(peer.url())],
            timeouts,
            ..Default::default()
        };
        let config = Arc::new(Configuration::in_memory(data));
        let repository = Arc::new(MemoryRepository::new());
        let addresses = Arc::new(StaticAddressSupplier::new(config.clone()));
        let client = BepClient::new(config.clone(), repository.clone(), repository.clone(), addresses)?;
        Ok(Self {
            client,
            config,
            repository,
        })
    }
}

/// Runs `script` on a session accepted by `peer` in a background thread.
///
/// The session is handed back through the join handle so the connection
/// stays open until the test drops it.
pub fn spawn_peer<F, T>(peer: TestPeer, expected: bep_core::DeviceId, script: F) -> JoinHandle<TestResult<(PeerSession, T)>>
where
    F: FnOnce(&mut PeerSession) -> TestResult<T> + Send + 'static,
    T: Send + 'static,
{
    thread::spawn(move || {
        let mut session = peer.accept(Some(expected))?;
        let value = script(&mut session)?;
        Ok((session, value))
    })
}
