//! BEP Index - Index synchronization engine.
//!
//! Merges file records received from peers into the local repository:
//! - Last-writer-wins merge on modification time
//! - Per (device, folder) sequence bookkeeping
//! - A single-worker queue that parks backlog in the temp repository
//! - Listener registry for acquired records, completed indexes and changes
//! - Directory and folder browsers over the merged index

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod browser;
pub mod events;
pub mod folder_browser;
pub mod handler;
mod queue;

pub use browser::{BrowserOptions, BrowserOrdering, IndexBrowser};
pub use events::{FullIndexAcquired, IndexChange, IndexRecordsAcquired, ListenerId, Listeners};
pub use folder_browser::FolderBrowser;
pub use handler::IndexHandler;

use std::time::Duration;

use bep_core::DeviceId;
use thiserror::Error;

/// View of a connected peer needed by the index engine.
pub trait IndexPeer: Send + Sync {
    /// Remote device.
    fn device_id(&self) -> DeviceId;

    /// Folders both sides share on this connection.
    fn shared_folders(&self) -> Vec<String>;

    /// Time since the last successful read or write.
    fn last_active(&self) -> Duration;
}

/// Errors from the index engine.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The remote index did not arrive in time
    #[error("Timeout waiting for index: {0}")]
    Timeout(String),

    /// A progress record is required but absent
    #[error("No index info for device {device} in folder {folder}")]
    MissingIndexInfo {
        /// Peer device
        device: DeviceId,
        /// Folder id
        folder: String,
    },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation needs a different record type
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Engine is closed
    #[error("Index handler closed")]
    Closed,

    /// Storage error
    #[error(transparent)]
    Store(#[from] bep_store::StoreError),

    /// Model error
    #[error(transparent)]
    Core(#[from] bep_core::CoreError),

    /// Parked batch cannot be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}
