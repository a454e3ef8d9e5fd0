//! BEP Client - Connections, block transfer and peer management.
//!
//! This crate provides:
//! - The per-peer connection engine (handshake, framed I/O, dispatch)
//! - Block downloads and uploads with blocking progress observers
//! - Thread executors owned by connections and the client
//! - The client connection manager over an address supplier

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod client;
pub mod connection;
pub mod discovery;
mod error;
pub mod executor;
pub mod transfer;

pub use client::{load_keystore, BepClient, ConnectionChange, PeerStatus};
pub use connection::{
    ClusterConfigFolderInfo, ClusterConfigInfo, ConnectionHandler, ConnectionObserver, PendingWrite, RequestSource,
};
pub use discovery::{AddressSupplier, StaticAddressSupplier};
pub use error::ClientError;
pub use transfer::{BlockPuller, BlockPusher, BlockStream, FileDownloadObserver, FileUploadObserver, IndexEditObserver};
