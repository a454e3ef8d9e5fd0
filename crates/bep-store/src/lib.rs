//! BEP Store - Local index storage.
//!
//! Provides:
//! - Repository interfaces (`IndexRepository`, `Sequencer`, `TempRepository`)
//! - An in-memory implementation for tests and ephemeral clients
//! - A RocksDB implementation whose sequence counter survives restarts

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod memory;
pub mod repository;
pub mod rocks;

pub use config::StoreConfig;
pub use memory::{MemoryRepository, MemorySequencer};
pub use repository::{IndexRepository, Sequencer, TempRepository};
pub use rocks::{RocksRepository, RocksSequencer};

use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RocksDB error
    #[error("Database error: {0}")]
    Database(String),

    /// Entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] bep_core::DecodeError),

    /// Record rejected by a model check
    #[error(transparent)]
    Core(#[from] bep_core::CoreError),

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),
}
