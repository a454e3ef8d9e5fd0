//! BEP Core - Core types for the Block Exchange Protocol sync client.
//!
//! This crate provides:
//! - Device identity (`DeviceId`) derived from certificate hashes
//! - The index data model (files, blocks, folders, per-peer index progress)
//! - Block hashing and folder-relative path helpers
//! - Peer addresses and client configuration
//! - Record encoding for durable storage

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod address;
pub mod blocks;
pub mod config;
pub mod device_id;
pub mod encoding;
pub mod model;
pub mod path;
pub mod time;

pub use address::{AddressProducer, AddressType, DeviceAddress};
pub use blocks::{BlockInfo, BlockList, BLOCK_SIZE};
pub use config::Configuration;
pub use device_id::{DeviceId, DeviceIdError};
pub use encoding::{DecodeError, RecordDecode, RecordEncode};
pub use model::*;
pub use time::now_millis;

/// Client name announced in Hello.
pub const CLIENT_NAME: &str = "bep-rs";

/// Client version announced in Hello.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised by core types.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A block list does not match its file record
    #[error("inconsistent blocks: {0}")]
    InconsistentBlocks(String),

    /// A record violates a model invariant
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// An address cannot be parsed or resolved
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration cannot be read or written
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid device id
    #[error(transparent)]
    DeviceId(#[from] DeviceIdError),

    /// Record decoding failed
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
