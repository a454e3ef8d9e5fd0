//! TLS sockets between devices.
//!
//! Devices present self-signed certificates, so both sides accept any
//! certificate during the handshake (handshake signatures are still checked
//! with the provider's algorithms). Identity is established afterwards by
//! hashing the peer certificate into a [`DeviceId`].
//!
//! A [`TlsSocket`] can hand out independent [`TlsReader`] and [`TlsWriter`]
//! handles for use on different threads. Readers block on the TCP socket
//! without holding the TLS state lock, so a writer is never stalled by an
//! idle reader. Received ciphertext is queued on the socket and passed to
//! rustls only once the previous plaintext has been read out.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bep_core::DeviceId;
use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, DistinguishedName, ServerConfig,
    ServerConnection, SignatureScheme,
};
use tracing::{debug, trace};

use crate::keystore::Keystore;
use crate::TransportError;

/// ALPN protocol of BEP connections.
pub const ALPN_BEP: &[u8] = b"bep/1.0";

/// ALPN protocol of relay control connections.
pub const ALPN_RELAY: &[u8] = b"bep-relay";

const SERVER_NAME: &str = "syncthing";
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Accepts any end-entity certificate; verifies handshake signatures only.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for AcceptAnyCertificate {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Client configuration presenting our certificate.
pub fn client_config(keystore: &Keystore, alpn: &[u8]) -> Result<Arc<ClientConfig>, TransportError> {
    let provider = provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_client_auth_cert(vec![keystore.certificate().clone()], keystore.private_key())?;
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(Arc::new(config))
}

/// Server configuration requiring a client certificate.
pub fn server_config(keystore: &Keystore, alpn: &[u8]) -> Result<Arc<ServerConfig>, TransportError> {
    let provider = provider();
    let mut config = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_single_cert(vec![keystore.certificate().clone()], keystore.private_key())?;
    config.alpn_protocols = vec![alpn.to_vec()];
    Ok(Arc::new(config))
}

struct Shared {
    conn: Mutex<Connection>,
    // ciphertext read from the socket that rustls has not taken yet; rustls
    // rejects input while too much decrypted plaintext is unread
    pending: Mutex<Vec<u8>>,
    socket: TcpStream,
    // serializes record encryption with the socket write that carries it
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

/// An authenticated TLS connection to a device.
#[derive(Clone)]
pub struct TlsSocket {
    shared: Arc<Shared>,
    peer: DeviceId,
    peer_addr: Option<SocketAddr>,
}

impl TlsSocket {
    /// Performs the client side of the handshake on `tcp`.
    pub fn connect(
        tcp: TcpStream,
        keystore: &Keystore,
        alpn: &[u8],
        expected: Option<DeviceId>,
    ) -> Result<Self, TransportError> {
        let config = client_config(keystore, alpn)?;
        let name = ServerName::try_from(SERVER_NAME)
            .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        let conn = ClientConnection::new(config, name)?;
        Self::handshake(Connection::Client(conn), tcp, alpn, expected)
    }

    /// Performs the server side of the handshake on `tcp`.
    pub fn accept(
        tcp: TcpStream,
        keystore: &Keystore,
        alpn: &[u8],
        expected: Option<DeviceId>,
    ) -> Result<Self, TransportError> {
        let config = server_config(keystore, alpn)?;
        let conn = ServerConnection::new(config)?;
        Self::handshake(Connection::Server(conn), tcp, alpn, expected)
    }

    fn handshake(
        mut conn: Connection,
        mut tcp: TcpStream,
        alpn: &[u8],
        expected: Option<DeviceId>,
    ) -> Result<Self, TransportError> {
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp)
                .map_err(|e| TransportError::HandshakeFailed(e.to_string()))?;
        }
        while conn.wants_write() {
            conn.write_tls(&mut tcp)?;
        }

        let peer = conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| DeviceId::from_certificate(cert.as_ref()))
            .ok_or_else(|| TransportError::HandshakeFailed("peer presented no certificate".into()))?;
        if let Some(expected) = expected {
            if expected != peer {
                return Err(TransportError::DeviceIdMismatch { expected, actual: peer });
            }
        }
        if conn.alpn_protocol() != Some(alpn) {
            debug!(peer = %peer, "peer did not negotiate {}", String::from_utf8_lossy(alpn));
        }

        let peer_addr = tcp.peer_addr().ok();
        debug!(peer = %peer, addr = ?peer_addr, "tls handshake complete");
        Ok(Self {
            shared: Arc::new(Shared {
                conn: Mutex::new(conn),
                pending: Mutex::new(Vec::new()),
                socket: tcp,
                write_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
            peer,
            peer_addr,
        })
    }

    /// Device id derived from the peer certificate.
    pub fn peer_device_id(&self) -> DeviceId {
        self.peer
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Returns a new read handle.
    pub fn reader(&self) -> TlsReader {
        TlsReader {
            shared: self.shared.clone(),
            buffer: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
        }
    }

    /// Returns a new write handle.
    pub fn writer(&self) -> TlsWriter {
        TlsWriter {
            shared: self.shared.clone(),
        }
    }

    /// Sets the read timeout of the underlying socket.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.shared.socket.set_read_timeout(timeout)
    }

    /// Returns true once `shutdown` was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Sends close_notify when no write is in flight, then shuts the socket
    /// down in both directions, unblocking readers. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(_guard) = self.shared.write_lock.try_lock() {
            let mut out = Vec::new();
            {
                let mut conn = self.shared.conn.lock();
                conn.send_close_notify();
                while conn.wants_write() {
                    if conn.write_tls(&mut out).is_err() {
                        break;
                    }
                }
            }
            let _ = (&self.shared.socket).write_all(&out);
        }
        let _ = self.shared.socket.shutdown(Shutdown::Both);
        trace!(peer = %self.peer, "tls socket shut down");
    }
}

/// Read half of a [`TlsSocket`].
pub struct TlsReader {
    shared: Arc<Shared>,
    buffer: Box<[u8]>,
}

impl Read for TlsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut conn = self.shared.conn.lock();
                match conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }

                // plaintext is drained, hand rustls the next slice of input
                let mut pending = self.shared.pending.lock();
                if !pending.is_empty() {
                    let consumed = conn.read_tls(&mut pending.as_slice())?;
                    if consumed == 0 {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "tls input not accepted"));
                    }
                    pending.drain(..consumed);
                    drop(pending);
                    conn.process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    continue;
                }
            }

            let n = (&self.shared.socket).read(&mut self.buffer)?;
            if n == 0 {
                return Ok(0);
            }
            self.shared.pending.lock().extend_from_slice(&self.buffer[..n]);
        }
    }
}

/// Write half of a [`TlsSocket`].
pub struct TlsWriter {
    shared: Arc<Shared>,
}

impl Write for TlsWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket closed"));
        }
        let _guard = self.shared.write_lock.lock();
        let mut written = 0;
        while written < data.len() {
            let mut out = Vec::new();
            {
                let mut conn = self.shared.conn.lock();
                written += conn.writer().write(&data[written..])?;
                while conn.wants_write() {
                    conn.write_tls(&mut out)?;
                }
            }
            (&self.shared.socket).write_all(&out)?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeystoreLoader;
    use std::net::TcpListener;
    use std::thread;

    type Handshake = Result<TlsSocket, TransportError>;

    fn pair(expected_by_client: Option<DeviceId>) -> (Handshake, Handshake, DeviceId, DeviceId) {
        let loader = KeystoreLoader::new();
        let (server_ks, _) = loader.generate().unwrap();
        let (client_ks, _) = loader.generate().unwrap();
        let server_id = server_ks.device_id();
        let client_id = client_ks.device_id();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            TlsSocket::accept(tcp, &server_ks, ALPN_BEP, None)
        });

        let tcp = TcpStream::connect(addr).unwrap();
        let client = TlsSocket::connect(tcp, &client_ks, ALPN_BEP, expected_by_client.or(Some(server_id)));
        let server = server.join().unwrap();
        (client, server, client_id, server_id)
    }

    #[test]
    fn test_handshake_and_exchange() {
        let (client, server, client_id, server_id) = pair(None);
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(client.peer_device_id(), server_id);
        assert_eq!(server.peer_device_id(), client_id);

        let mut writer = client.writer();
        writer.write_all(b"hello over tls").unwrap();

        let mut reader = server.reader();
        let mut buf = [0u8; 14];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello over tls");

        let big = vec![7u8; 300 * 1024];
        let sender = thread::spawn(move || {
            server.writer().write_all(&big).unwrap();
            server
        });
        let mut received = vec![0u8; 300 * 1024];
        client.reader().read_exact(&mut received).unwrap();
        assert!(received.iter().all(|b| *b == 7));
        let server = sender.join().unwrap();

        client.shutdown();
        assert!(client.is_closed());
        let mut rest = Vec::new();
        let _ = server.reader().read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_large_frame_buffered_before_read() {
        let (client, server, _, _) = pair(None);
        let client = client.unwrap();
        let server = server.unwrap();

        // a full block response plus framing, written before anyone reads
        let frame: Vec<u8> = (0..131_136u32).map(|i| (i % 251) as u8).collect();
        let expected = frame.clone();
        let sender = thread::spawn(move || {
            let mut writer = server.writer();
            writer.write_all(&frame).unwrap();
            writer.write_all(&frame).unwrap();
            server
        });
        thread::sleep(Duration::from_millis(300));

        let mut reader = client.reader();
        for _ in 0..2 {
            let mut received = vec![0u8; expected.len()];
            reader.read_exact(&mut received).unwrap();
            assert!(received == expected);
        }
        let _server = sender.join().unwrap();
    }

    #[test]
    fn test_device_id_mismatch() {
        let (client, _server, _, _) = pair(Some(DeviceId::new([9; 32])));
        assert!(matches!(client, Err(TransportError::DeviceIdMismatch { .. })));
    }
}
