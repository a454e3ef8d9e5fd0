//! Transport opening and configuration.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bep_core::{AddressType, CoreError, DeviceAddress, DeviceId};
use bep_proto::ProtoError;
use thiserror::Error;
use tracing::{debug, info};

use crate::keystore::Keystore;
use crate::relay::RelayClient;
use crate::tls::{TlsSocket, ALPN_BEP, ALPN_RELAY};

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timeout
    #[error("Connection timeout")]
    Timeout,

    /// Handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer certificate does not belong to the expected device
    #[error("Device id mismatch: expected {expected}, got {actual}")]
    DeviceIdMismatch {
        /// Device we dialed
        expected: DeviceId,
        /// Device derived from the presented certificate
        actual: DeviceId,
    },

    /// Keystore cannot be generated or parsed
    #[error("Keystore error: {0}")]
    Keystore(String),

    /// Address scheme we cannot dial
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    /// Relay refused or broke the session
    #[error("Relay error: {0}")]
    Relay(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Relay or framing codec error
    #[error(transparent)]
    Proto(#[from] ProtoError),

    /// Address error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Read timeout during the TLS handshake, kept on the socket until the
    /// caller clears it
    pub handshake_timeout: Duration,
    /// Read timeout on relay control connections
    pub relay_read_timeout: Duration,
    /// ALPN protocol of BEP connections
    pub bep_alpn: Vec<u8>,
    /// ALPN protocol of relay control connections
    pub relay_alpn: Vec<u8>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
            relay_read_timeout: Duration::from_millis(2000),
            bep_alpn: ALPN_BEP.to_vec(),
            relay_alpn: ALPN_RELAY.to_vec(),
        }
    }
}

/// Opens authenticated BEP sockets with the local identity.
#[derive(Debug, Clone)]
pub struct Transport {
    keystore: Arc<Keystore>,
    config: TransportConfig,
}

impl Transport {
    /// Creates a transport with the default configuration.
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self::with_config(keystore, TransportConfig::default())
    }

    /// Creates a transport with a custom configuration.
    pub fn with_config(keystore: Arc<Keystore>, config: TransportConfig) -> Self {
        Self { keystore, config }
    }

    /// Local identity.
    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    /// Transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Opens a TLS socket to the device behind `address`.
    ///
    /// `tcp://` addresses are dialed directly. `relay://` addresses go through
    /// a relay session; the invitation decides whether we act as TLS client
    /// or server. The peer certificate must match `address.device_id`.
    ///
    /// The socket keeps `handshake_timeout` as its read timeout; callers
    /// clear it with [`TlsSocket::set_read_timeout`] once their own
    /// handshake is done.
    pub fn open(&self, address: &DeviceAddress) -> Result<TlsSocket, TransportError> {
        match address.address_type() {
            AddressType::Tcp => {
                let addr = address.socket_addr()?;
                debug!(address = %address.address, "opening tcp connection");
                let tcp = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
                tcp.set_nodelay(true)?;
                tcp.set_read_timeout(Some(self.config.handshake_timeout))?;
                TlsSocket::connect(tcp, &self.keystore, &self.config.bep_alpn, Some(address.device_id))
            }
            AddressType::Relay => {
                let session = RelayClient::new(&self.keystore, &self.config).open_session(address)?;
                info!(address = %address.address, server = session.server_socket, "relay session ready");
                session.stream.set_read_timeout(Some(self.config.handshake_timeout))?;
                if session.server_socket {
                    TlsSocket::accept(session.stream, &self.keystore, &self.config.bep_alpn, Some(address.device_id))
                } else {
                    TlsSocket::connect(session.stream, &self.keystore, &self.config.bep_alpn, Some(address.device_id))
                }
            }
            AddressType::HttpRelay | AddressType::HttpsRelay | AddressType::Other | AddressType::Null => {
                Err(TransportError::UnsupportedAddress(address.address.clone()))
            }
        }
    }

    /// Completes the server side of a BEP handshake on an accepted stream.
    pub fn accept(&self, tcp: TcpStream, expected: Option<DeviceId>) -> Result<TlsSocket, TransportError> {
        tcp.set_nodelay(true)?;
        TlsSocket::accept(tcp, &self.keystore, &self.config.bep_alpn, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeystoreLoader;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.relay_read_timeout, Duration::from_millis(2000));
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.bep_alpn, b"bep/1.0");
        assert_eq!(config.relay_alpn, b"bep-relay");
    }

    #[test]
    fn test_unsupported_address() {
        let (keystore, _) = KeystoreLoader::new().generate().unwrap();
        let transport = Transport::new(keystore);
        let address = DeviceAddress::new(DeviceId::new([1; 32]), "relay-https://example.org/x");
        assert!(matches!(
            transport.open(&address),
            Err(TransportError::UnsupportedAddress(_))
        ));
        let address = DeviceAddress::new(DeviceId::new([1; 32]), "");
        assert!(matches!(
            transport.open(&address),
            Err(TransportError::UnsupportedAddress(_))
        ));
    }
}
