//! Relay protocol control messages.
//!
//! ```text
//! [u32 BE magic 0x9E79BC40][u32 BE type][u32 BE length][payload]
//! ```
//!
//! Byte strings inside payloads are prefixed with a u32 BE length.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bep_core::DeviceId;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtoError;

/// Relay protocol magic.
pub const RELAY_MAGIC: u32 = 0x9E79_BC40;

/// Largest accepted control payload.
pub const MAX_RELAY_PAYLOAD: usize = 64 * 1024;

/// Response code for success.
pub const RESPONSE_SUCCESS: u32 = 0;
/// Response code when the target device is not connected to the relay.
pub const RESPONSE_NOT_FOUND: u32 = 1;
/// Response code when the device is already connected.
pub const RESPONSE_ALREADY_CONNECTED: u32 = 2;

const TYPE_JOIN_SESSION_REQUEST: u32 = 3;
const TYPE_RESPONSE: u32 = 4;
const TYPE_CONNECT_REQUEST: u32 = 5;
const TYPE_SESSION_INVITATION: u32 = 6;

/// Invitation to a relay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInvitation {
    /// Device on the other end of the session
    pub from: DeviceId,
    /// Session key
    pub key: Vec<u8>,
    /// Session address; `None` means the relay's own address
    pub address: Option<IpAddr>,
    /// Session port
    pub port: u16,
    /// We act as TLS server on the session
    pub server_socket: bool,
}

/// Relay control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Join a session with its key
    JoinSessionRequest {
        /// Session key
        key: Vec<u8>,
    },
    /// Result of a request
    Response {
        /// Result code
        code: u32,
        /// Human readable message
        message: String,
    },
    /// Ask the relay for a session with a device
    ConnectRequest {
        /// Target device
        device_id: DeviceId,
    },
    /// Session invitation
    SessionInvitation(SessionInvitation),
}

fn put_data(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn need(buf: &Bytes, len: usize) -> Result<(), ProtoError> {
    if buf.remaining() < len {
        return Err(ProtoError::InvalidLength(len));
    }
    Ok(())
}

fn get_data(buf: &mut Bytes) -> Result<Bytes, ProtoError> {
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

impl RelayMessage {
    fn type_code(&self) -> u32 {
        match self {
            RelayMessage::JoinSessionRequest { .. } => TYPE_JOIN_SESSION_REQUEST,
            RelayMessage::Response { .. } => TYPE_RESPONSE,
            RelayMessage::ConnectRequest { .. } => TYPE_CONNECT_REQUEST,
            RelayMessage::SessionInvitation(_) => TYPE_SESSION_INVITATION,
        }
    }

    fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            RelayMessage::JoinSessionRequest { key } => put_data(&mut buf, key),
            RelayMessage::Response { code, message } => {
                buf.put_u32(*code);
                put_data(&mut buf, message.as_bytes());
            }
            RelayMessage::ConnectRequest { device_id } => put_data(&mut buf, device_id.as_bytes()),
            RelayMessage::SessionInvitation(invitation) => {
                put_data(&mut buf, invitation.from.as_bytes());
                put_data(&mut buf, &invitation.key);
                match invitation.address {
                    Some(IpAddr::V4(ip)) => put_data(&mut buf, &ip.octets()),
                    Some(IpAddr::V6(ip)) => put_data(&mut buf, &ip.octets()),
                    None => put_data(&mut buf, &[]),
                }
                buf.put_u16(0);
                buf.put_u16(invitation.port);
                buf.put_u32(invitation.server_socket as u32);
            }
        }
        buf
    }

    fn decode_payload(type_code: u32, mut buf: Bytes) -> Result<Self, ProtoError> {
        match type_code {
            TYPE_JOIN_SESSION_REQUEST => Ok(RelayMessage::JoinSessionRequest {
                key: get_data(&mut buf)?.to_vec(),
            }),
            TYPE_RESPONSE => {
                need(&buf, 4)?;
                let code = buf.get_u32();
                let message = String::from_utf8_lossy(&get_data(&mut buf)?).into_owned();
                Ok(RelayMessage::Response { code, message })
            }
            TYPE_CONNECT_REQUEST => Ok(RelayMessage::ConnectRequest {
                device_id: DeviceId::from_hash(&get_data(&mut buf)?)?,
            }),
            TYPE_SESSION_INVITATION => {
                let from = DeviceId::from_hash(&get_data(&mut buf)?)?;
                let key = get_data(&mut buf)?.to_vec();
                let address = match get_data(&mut buf)?.as_ref() {
                    [a, b, c, d] => Some(IpAddr::V4(Ipv4Addr::new(*a, *b, *c, *d))),
                    raw if raw.len() == 16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(raw);
                        Some(IpAddr::V6(Ipv6Addr::from(octets)))
                    }
                    [] => None,
                    raw => return Err(ProtoError::Relay(format!("invalid address length {}", raw.len()))),
                }
                .filter(|ip| !ip.is_unspecified());

                need(&buf, 8)?;
                let zero = buf.get_u16();
                if zero != 0 {
                    return Err(ProtoError::Relay(format!("expected 0, found {zero}")));
                }
                let port = buf.get_u16();
                if port == 0 {
                    return Err(ProtoError::Relay("invalid port 0".into()));
                }
                let server_socket = buf.get_u32() & 1 == 1;
                if key.is_empty() {
                    return Err(ProtoError::Relay("empty session key".into()));
                }

                Ok(RelayMessage::SessionInvitation(SessionInvitation {
                    from,
                    key,
                    address,
                    port,
                    server_socket,
                }))
            }
            other => Err(ProtoError::Relay(format!("unknown message type {other}"))),
        }
    }
}

/// Writes a relay control message.
pub fn write_relay_message<W: Write>(writer: &mut W, message: &RelayMessage) -> Result<(), ProtoError> {
    let payload = message.encode_payload();
    let mut buf = BytesMut::with_capacity(12 + payload.len());
    buf.put_u32(RELAY_MAGIC);
    buf.put_u32(message.type_code());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads a relay control message.
pub fn read_relay_message<R: Read>(reader: &mut R) -> Result<RelayMessage, ProtoError> {
    let mut header = [0u8; 12];
    reader.read_exact(&mut header)?;
    let mut header = Bytes::copy_from_slice(&header);
    let magic = header.get_u32();
    if magic != RELAY_MAGIC {
        return Err(ProtoError::InvalidMagic(magic));
    }
    let type_code = header.get_u32();
    let len = header.get_u32() as usize;
    if len > MAX_RELAY_PAYLOAD {
        return Err(ProtoError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    RelayMessage::decode_payload(type_code, Bytes::from(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(message: RelayMessage) -> RelayMessage {
        let mut buf = Vec::new();
        write_relay_message(&mut buf, &message).unwrap();
        read_relay_message(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn test_connect_request_layout() {
        let device = DeviceId::new([0x11; 32]);
        let mut buf = Vec::new();
        write_relay_message(&mut buf, &RelayMessage::ConnectRequest { device_id: device }).unwrap();
        assert_eq!(&buf[0..4], &[0x9E, 0x79, 0xBC, 0x40]);
        assert_eq!(&buf[4..8], &5u32.to_be_bytes());
        assert_eq!(&buf[8..12], &36u32.to_be_bytes());
        assert_eq!(&buf[12..16], &32u32.to_be_bytes());
        assert_eq!(&buf[16..], device.as_bytes());
    }

    #[test]
    fn test_messages() {
        let join = RelayMessage::JoinSessionRequest { key: vec![1, 2, 3] };
        assert_eq!(roundtrip(join.clone()), join);

        let response = RelayMessage::Response {
            code: RESPONSE_NOT_FOUND,
            message: "not found".into(),
        };
        assert_eq!(roundtrip(response.clone()), response);
    }

    #[test]
    fn test_session_invitation() {
        let invitation = SessionInvitation {
            from: DeviceId::new([7; 32]),
            key: vec![0xAA; 32],
            address: Some(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))),
            port: 22067,
            server_socket: true,
        };
        let decoded = roundtrip(RelayMessage::SessionInvitation(invitation.clone()));
        assert_eq!(decoded, RelayMessage::SessionInvitation(invitation));
    }

    #[test]
    fn test_unspecified_address_means_relay() {
        let invitation = SessionInvitation {
            from: DeviceId::new([7; 32]),
            key: vec![1],
            address: Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: 1234,
            server_socket: false,
        };
        match roundtrip(RelayMessage::SessionInvitation(invitation)) {
            RelayMessage::SessionInvitation(decoded) => assert!(decoded.address.is_none()),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = Vec::new();
        write_relay_message(&mut buf, &RelayMessage::JoinSessionRequest { key: vec![1] }).unwrap();
        buf[3] = 0;
        assert!(matches!(
            read_relay_message(&mut Cursor::new(buf)),
            Err(ProtoError::InvalidMagic(_))
        ));
    }
}
