//! Connection/protocol engine.
//!
//! A [`ConnectionHandler`] runs the BEP handshake with one peer, then routes
//! received messages: index traffic to the index engine, block requests to
//! registered upload sources and responses to waiting downloads.

mod cluster;
mod handler;

pub use cluster::{ClusterConfigFolderInfo, ClusterConfigInfo};
pub use handler::{ConnectionHandler, PendingWrite, RequestSource, DISPATCH_THREADS};

use bep_core::FolderInfo;

/// Receives connection lifecycle notifications.
pub trait ConnectionObserver: Send + Sync {
    /// The connection was established or closed.
    fn on_connection_changed(&self, _connection: &ConnectionHandler) {}

    /// The peer shared a folder that was not configured before. The folder
    /// is already added to the configuration.
    fn on_new_folder_shared(&self, _folder: &FolderInfo) {}
}
