//! Integration and end-to-end tests for the BEP client.
//!
//! This crate provides:
//! - A scripted peer that speaks BEP over real TLS sockets on loopback
//! - Client fixtures backed by in-memory storage
//! - Integration tests for connections, downloads and uploads

pub mod harness;
pub mod peer;

pub use harness::{spawn_peer, test_timeouts, ClientFixture};
pub use peer::{wire_dir, wire_file, PeerSession, TestError, TestPeer, TestResult, PEER_INDEX_ID};
