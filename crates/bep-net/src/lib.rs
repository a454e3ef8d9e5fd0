//! BEP Network - Authenticated transport between devices.
//!
//! Provides:
//! - The local TLS identity (`Keystore`) and its loader cache
//! - TLS sockets that split into reader and writer halves
//! - Relay session establishment
//! - Connection state and traffic counters

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod connection;
pub mod keystore;
pub mod relay;
pub mod tls;
pub mod transport;

pub use connection::{ConnectionId, ConnectionState, ConnectionStats, StatsSnapshot};
pub use keystore::{Keystore, KeystoreLoader};
pub use relay::{RelayClient, RelaySession};
pub use tls::{TlsReader, TlsSocket, TlsWriter, ALPN_BEP, ALPN_RELAY};
pub use transport::{Transport, TransportConfig, TransportError};
