//! Relay session client.
//!
//! A relay connection takes two steps. A short-lived TLS control connection
//! (ALPN `bep-relay`) asks the relay for a session with the target device
//! and receives a [`SessionInvitation`]. A plain TCP connection to the
//! session address then joins the session with the invitation key; once the
//! relay answers with success the stream carries the BEP TLS connection.

use std::net::{SocketAddr, TcpStream};

use bep_core::{DeviceAddress, DeviceId};
use bep_proto::relay::RESPONSE_SUCCESS;
use bep_proto::{read_relay_message, write_relay_message, RelayMessage, SessionInvitation};
use tracing::debug;

use crate::keystore::Keystore;
use crate::tls::TlsSocket;
use crate::{TransportConfig, TransportError};

/// Joined relay session.
#[derive(Debug)]
pub struct RelaySession {
    /// Stream relayed to the remote device
    pub stream: TcpStream,
    /// True when we act as TLS server on the stream
    pub server_socket: bool,
    /// Remote device
    pub peer: DeviceId,
}

/// Client for the relay control protocol.
pub struct RelayClient<'a> {
    keystore: &'a Keystore,
    config: &'a TransportConfig,
}

impl<'a> RelayClient<'a> {
    /// Creates a client presenting `keystore` to relays.
    pub fn new(keystore: &'a Keystore, config: &'a TransportConfig) -> Self {
        Self { keystore, config }
    }

    /// Requests a session with `address.device_id` from the relay at
    /// `address` and joins it.
    pub fn open_session(&self, address: &DeviceAddress) -> Result<RelaySession, TransportError> {
        let relay_addr = address.socket_addr()?;
        let relay_id = address.uri_param("id").and_then(|id| id.parse::<DeviceId>().ok());
        let invitation = self.session_invitation(relay_addr, relay_id, address.device_id)?;
        self.join_session(relay_addr, &invitation)
    }

    /// Runs the control exchange: ConnectRequest, then SessionInvitation.
    pub fn session_invitation(
        &self,
        relay_addr: SocketAddr,
        relay_id: Option<DeviceId>,
        device_id: DeviceId,
    ) -> Result<SessionInvitation, TransportError> {
        debug!(relay = %relay_addr, "connecting to relay (control)");
        let tcp = TcpStream::connect_timeout(&relay_addr, self.config.connect_timeout)?;
        tcp.set_read_timeout(Some(self.config.relay_read_timeout))?;
        let socket = TlsSocket::connect(tcp, self.keystore, &self.config.relay_alpn, relay_id)?;

        let result = self.request_invitation(&socket, device_id);
        socket.shutdown();
        result
    }

    fn request_invitation(&self, socket: &TlsSocket, device_id: DeviceId) -> Result<SessionInvitation, TransportError> {
        debug!(device = %device_id, "sending connect request");
        write_relay_message(&mut socket.writer(), &RelayMessage::ConnectRequest { device_id })?;

        match read_relay_message(&mut socket.reader())? {
            RelayMessage::SessionInvitation(invitation) => {
                if invitation.from != device_id {
                    return Err(TransportError::Relay(format!(
                        "invitation from {} while asking for {}",
                        invitation.from, device_id
                    )));
                }
                debug!(from = %invitation.from, port = invitation.port, server = invitation.server_socket, "received session invitation");
                Ok(invitation)
            }
            RelayMessage::Response { code, message } => {
                Err(TransportError::Relay(format!("relay refused session ({code}): {message}")))
            }
            other => Err(TransportError::Relay(format!("unexpected relay message {other:?}"))),
        }
    }

    /// Joins the session described by `invitation`. An invitation without an
    /// address points at the relay itself.
    pub fn join_session(
        &self,
        relay_addr: SocketAddr,
        invitation: &SessionInvitation,
    ) -> Result<RelaySession, TransportError> {
        let addr = SocketAddr::new(invitation.address.unwrap_or(relay_addr.ip()), invitation.port);
        debug!(relay = %addr, "connecting to relay (session)");
        let mut stream = TcpStream::connect_timeout(&addr, self.config.connect_timeout)?;
        stream.set_read_timeout(Some(self.config.relay_read_timeout))?;

        write_relay_message(
            &mut stream,
            &RelayMessage::JoinSessionRequest {
                key: invitation.key.clone(),
            },
        )?;
        match read_relay_message(&mut stream)? {
            RelayMessage::Response { code, .. } if code == RESPONSE_SUCCESS => {}
            RelayMessage::Response { code, message } => {
                return Err(TransportError::Relay(format!("join session failed ({code}): {message}")));
            }
            other => return Err(TransportError::Relay(format!("unexpected relay message {other:?}"))),
        }

        stream.set_read_timeout(None)?;
        stream.set_nodelay(true)?;
        debug!(relay = %addr, "relay connection ready");
        Ok(RelaySession {
            stream,
            server_socket: invitation.server_socket,
            peer: invitation.from,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::ALPN_RELAY;
    use crate::KeystoreLoader;
    use bep_proto::relay::RESPONSE_NOT_FOUND;
    use std::net::TcpListener;
    use std::thread;

    fn relay_control(reply: RelayMessage) -> (SocketAddr, thread::JoinHandle<RelayMessage>) {
        let (keystore, _) = KeystoreLoader::new().generate().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let socket = TlsSocket::accept(tcp, &keystore, ALPN_RELAY, None).unwrap();
            let request = read_relay_message(&mut socket.reader()).unwrap();
            write_relay_message(&mut socket.writer(), &reply).unwrap();
            request
        });
        (addr, handle)
    }

    #[test]
    fn test_session_invitation() {
        let target = DeviceId::new([4; 32]);
        let invitation = SessionInvitation {
            from: target,
            key: vec![1, 2, 3],
            address: None,
            port: 22067,
            server_socket: true,
        };
        let (addr, relay) = relay_control(RelayMessage::SessionInvitation(invitation.clone()));

        let (keystore, _) = KeystoreLoader::new().generate().unwrap();
        let config = TransportConfig::default();
        let received = RelayClient::new(&keystore, &config)
            .session_invitation(addr, None, target)
            .unwrap();
        assert_eq!(received, invitation);
        assert_eq!(
            relay.join().unwrap(),
            RelayMessage::ConnectRequest { device_id: target }
        );
    }

    #[test]
    fn test_session_refused() {
        let (addr, relay) = relay_control(RelayMessage::Response {
            code: RESPONSE_NOT_FOUND,
            message: "not found".into(),
        });
        let (keystore, _) = KeystoreLoader::new().generate().unwrap();
        let config = TransportConfig::default();
        let result = RelayClient::new(&keystore, &config).session_invitation(addr, None, DeviceId::new([4; 32]));
        assert!(matches!(result, Err(TransportError::Relay(_))));
        relay.join().unwrap();
    }

    #[test]
    fn test_join_session() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = thread::spawn(move || {
            let (mut tcp, _) = listener.accept().unwrap();
            let request = read_relay_message(&mut tcp).unwrap();
            write_relay_message(
                &mut tcp,
                &RelayMessage::Response {
                    code: RESPONSE_SUCCESS,
                    message: "success".into(),
                },
            )
            .unwrap();
            request
        });

        let (keystore, _) = KeystoreLoader::new().generate().unwrap();
        let config = TransportConfig::default();
        let invitation = SessionInvitation {
            from: DeviceId::new([5; 32]),
            key: vec![9; 32],
            address: Some(addr.ip()),
            port: addr.port(),
            server_socket: false,
        };
        let session = RelayClient::new(&keystore, &config)
            .join_session(addr, &invitation)
            .unwrap();
        assert!(!session.server_socket);
        assert_eq!(session.peer, DeviceId::new([5; 32]));
        assert_eq!(
            relay.join().unwrap(),
            RelayMessage::JoinSessionRequest { key: vec![9; 32] }
        );
    }
}
