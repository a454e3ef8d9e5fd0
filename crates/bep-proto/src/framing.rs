//! BEP stream framing.
//!
//! # Hello
//!
//! ```text
//! [u32 BE magic 0x2EA7D90B][u16 BE length][Hello]
//! ```
//!
//! # Messages
//!
//! ```text
//! [u16 BE header length][Header][u32 BE payload length][payload]
//! ```
//!
//! A header length of zero is skipped. LZ4 payloads carry a big-endian
//! u32 uncompressed length followed by a raw LZ4 block. Outbound frames are
//! never compressed.

use std::io::{Read, Write};

use prost::Message as _;
use tracing::{trace, warn};

use crate::bep::{Header, Hello, MessageCompression, MessageType};
use crate::messages::Message;
use crate::ProtoError;

/// Magic number preceding the Hello message.
pub const HELLO_MAGIC: u32 = 0x2EA7_D90B;

/// Largest accepted payload (compressed or not).
pub const MAX_PAYLOAD_SIZE: usize = 512 * 1024 * 1024;

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, ProtoError> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ProtoError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_exact_vec<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProtoError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Encodes a Hello with its magic and length prefix.
pub fn encode_hello(hello: &Hello) -> Result<Vec<u8>, ProtoError> {
    let payload = hello.encode_to_vec();
    let len = u16::try_from(payload.len()).map_err(|_| ProtoError::TooLarge(payload.len()))?;
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(&HELLO_MAGIC.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Writes a Hello.
pub fn write_hello<W: Write>(writer: &mut W, hello: &Hello) -> Result<(), ProtoError> {
    writer.write_all(&encode_hello(hello)?)?;
    writer.flush()?;
    Ok(())
}

/// Reads a Hello, checking the magic.
pub fn read_hello<R: Read>(reader: &mut R) -> Result<Hello, ProtoError> {
    let magic = read_u32(reader)?;
    if magic != HELLO_MAGIC {
        return Err(ProtoError::InvalidMagic(magic));
    }
    let len = read_u16(reader)? as usize;
    if len == 0 {
        return Err(ProtoError::InvalidLength(0));
    }
    let payload = read_exact_vec(reader, len)?;
    Ok(Hello::decode(payload.as_slice())?)
}

/// Encodes a header, spelling out the type field when every field holds its
/// default so the header length is never zero.
pub fn encode_header(header: &Header) -> Vec<u8> {
    let encoded = header.encode_to_vec();
    if encoded.is_empty() {
        // field 1, varint, value 0
        return vec![0x08, 0x00];
    }
    encoded
}

/// Encodes a message as an uncompressed frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, ProtoError> {
    let header = encode_header(&Header {
        r#type: message.message_type() as i32,
        compression: MessageCompression::None as i32,
    });
    let payload = message.encode_payload();
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::TooLarge(payload.len()));
    }

    let mut out = Vec::with_capacity(2 + header.len() + 4 + payload.len());
    out.extend_from_slice(&(header.len() as u16).to_be_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Writes a message frame.
pub fn write_frame<W: Write>(writer: &mut W, message: &Message) -> Result<(), ProtoError> {
    writer.write_all(&encode_frame(message)?)?;
    writer.flush()?;
    Ok(())
}

/// Reads the next message frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Message, ProtoError> {
    let mut header_len = read_u16(reader)?;
    while header_len == 0 {
        warn!("got header length 0, skipping");
        header_len = read_u16(reader)?;
    }

    let header_bytes = read_exact_vec(reader, header_len as usize)?;
    let header = Header::decode(header_bytes.as_slice())?;
    let message_type = MessageType::try_from(header.r#type)
        .map_err(|_| ProtoError::UnknownMessageType(header.r#type))?;
    let compression = MessageCompression::try_from(header.compression)
        .map_err(|_| ProtoError::UnknownCompression(header.compression))?;

    let payload_len = read_u32(reader)? as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::TooLarge(payload_len));
    }
    let payload = read_exact_vec(reader, payload_len)?;
    let payload = match compression {
        MessageCompression::None => payload,
        MessageCompression::Lz4 => decompress_lz4(&payload)?,
    };

    trace!(?message_type, len = payload.len(), "read frame");
    Message::decode_payload(message_type, &payload)
}

/// Compresses a payload into the LZ4 frame form.
pub fn compress_lz4(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&lz4_flex::block::compress(payload));
    out
}

/// Decompresses an LZ4 frame payload.
pub fn decompress_lz4(payload: &[u8]) -> Result<Vec<u8>, ProtoError> {
    if payload.len() < 4 {
        return Err(ProtoError::InvalidLength(payload.len()));
    }
    let len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtoError::TooLarge(len));
    }
    lz4_flex::block::decompress(&payload[4..], len)
        .map_err(|e| ProtoError::Compression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bep::{ClusterConfig, Folder, Ping, Request};
    use std::io::Cursor;

    fn request() -> Message {
        Message::Request(Request {
            id: 7,
            folder: "default".into(),
            name: "a/b.txt".into(),
            offset: 131072,
            size: 1024,
            hash: vec![0xAB; 32],
            from_temporary: false,
        })
    }

    #[test]
    fn test_hello_layout() {
        let hello = Hello {
            device_name: "laptop".into(),
            client_name: "bep-rs".into(),
            client_version: "0.1.0".into(),
        };
        let bytes = encode_hello(&hello).unwrap();
        assert_eq!(&bytes[..4], &[0x2E, 0xA7, 0xD9, 0x0B]);
        assert_eq!(u16::from_be_bytes([bytes[4], bytes[5]]) as usize, bytes.len() - 6);
        assert_eq!(read_hello(&mut Cursor::new(bytes)).unwrap(), hello);
    }

    #[test]
    fn test_hello_bad_magic() {
        let mut bytes = encode_hello(&Hello::default()).unwrap();
        bytes[0] = 0;
        assert!(matches!(
            read_hello(&mut Cursor::new(bytes)),
            Err(ProtoError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_hello_zero_length() {
        let mut bytes = HELLO_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            read_hello(&mut Cursor::new(bytes)),
            Err(ProtoError::InvalidLength(0))
        ));
    }

    #[test]
    fn test_frame_sequence() {
        let mut stream = Vec::new();
        write_frame(&mut stream, &request()).unwrap();
        write_frame(&mut stream, &Message::Ping(Ping {})).unwrap();

        let mut cursor = Cursor::new(stream);
        assert_eq!(read_frame(&mut cursor).unwrap(), request());
        assert_eq!(read_frame(&mut cursor).unwrap(), Message::Ping(Ping {}));
    }

    #[test]
    fn test_zero_header_length_skipped() {
        let mut stream = vec![0, 0, 0, 0];
        stream.extend(encode_frame(&request()).unwrap());
        assert_eq!(read_frame(&mut Cursor::new(stream)).unwrap(), request());
    }

    #[test]
    fn test_lz4_payload() {
        let message = Message::ClusterConfig(ClusterConfig {
            folders: (0..20)
                .map(|i| Folder {
                    id: format!("folder-{i}"),
                    label: "the same label over and over".into(),
                    ..Default::default()
                })
                .collect(),
        });
        let header = encode_header(&Header {
            r#type: MessageType::ClusterConfig as i32,
            compression: MessageCompression::Lz4 as i32,
        });
        let payload = compress_lz4(&message.encode_payload());

        let mut stream = (header.len() as u16).to_be_bytes().to_vec();
        stream.extend_from_slice(&header);
        stream.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        stream.extend_from_slice(&payload);

        assert_eq!(read_frame(&mut Cursor::new(stream)).unwrap(), message);
    }

    #[test]
    fn test_unknown_message_type() {
        let header = Header {
            r#type: 99,
            compression: 0,
        }
        .encode_to_vec();
        let mut stream = (header.len() as u16).to_be_bytes().to_vec();
        stream.extend_from_slice(&header);
        stream.extend_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(stream)),
            Err(ProtoError::UnknownMessageType(99))
        ));
    }

    #[test]
    fn test_cluster_config_header_not_empty() {
        let frame = encode_frame(&Message::ClusterConfig(ClusterConfig::default())).unwrap();
        assert_eq!(u16::from_be_bytes([frame[0], frame[1]]), 2);
        assert_eq!(
            read_frame(&mut Cursor::new(frame)).unwrap(),
            Message::ClusterConfig(ClusterConfig::default())
        );
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let header = encode_header(&Header::default());
        let mut stream = (header.len() as u16).to_be_bytes().to_vec();
        stream.extend_from_slice(&header);
        stream.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            read_frame(&mut Cursor::new(stream)),
            Err(ProtoError::TooLarge(_))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let mut bytes = encode_frame(&request()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(read_frame(&mut Cursor::new(bytes)), Err(ProtoError::Io(_))));
    }
}
