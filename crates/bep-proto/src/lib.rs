//! BEP Protocol - Wire messages and stream framing.
//!
//! This crate defines:
//! - Protobuf messages of the Block Exchange Protocol (`bep`)
//! - The closed `Message` enum dispatched by connections
//! - Hello and message framing, including LZ4 payload decoding
//! - Relay protocol control messages

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod bep;
pub mod framing;
pub mod messages;
pub mod relay;

pub use framing::{read_frame, read_hello, write_frame, write_hello, HELLO_MAGIC, MAX_PAYLOAD_SIZE};
pub use messages::Message;
pub use relay::{read_relay_message, write_relay_message, RelayMessage, SessionInvitation};

use thiserror::Error;

/// Errors while reading or writing protocol data.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Stream did not start with the expected magic
    #[error("Invalid magic: {0:#010x}")]
    InvalidMagic(u32),

    /// Length field out of range
    #[error("Invalid length: {0}")]
    InvalidLength(usize),

    /// Payload exceeds the maximum size
    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),

    /// Header names an unknown message type
    #[error("Unknown message type: {0}")]
    UnknownMessageType(i32),

    /// Header names an unknown compression
    #[error("Unknown compression: {0}")]
    UnknownCompression(i32),

    /// LZ4 payload could not be decompressed
    #[error("Decompression failed: {0}")]
    Compression(String),

    /// Malformed relay message
    #[error("Relay protocol error: {0}")]
    Relay(String),

    /// Invalid device id on the wire
    #[error(transparent)]
    DeviceId(#[from] bep_core::DeviceIdError),

    /// Protobuf decoding failed
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtoError {
    /// Returns true if the error means the stream ended.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtoError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}
