//! Typed BEP messages.

use prost::Message as _;

use crate::bep::{
    ClusterConfig, Close, DownloadProgress, Index, IndexUpdate, MessageType, Ping, Request,
    Response,
};
use crate::ProtoError;

/// A decoded BEP message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Folder sharing announcement
    ClusterConfig(ClusterConfig),
    /// Full index
    Index(Index),
    /// Incremental index
    IndexUpdate(IndexUpdate),
    /// Block request
    Request(Request),
    /// Block response
    Response(Response),
    /// Download progress
    DownloadProgress(DownloadProgress),
    /// Keep-alive
    Ping(Ping),
    /// Orderly close
    Close(Close),
}

impl Message {
    /// Returns the header type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ClusterConfig(_) => MessageType::ClusterConfig,
            Message::Index(_) => MessageType::Index,
            Message::IndexUpdate(_) => MessageType::IndexUpdate,
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::DownloadProgress(_) => MessageType::DownloadProgress,
            Message::Ping(_) => MessageType::Ping,
            Message::Close(_) => MessageType::Close,
        }
    }

    /// Encodes the protobuf payload.
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Message::ClusterConfig(m) => m.encode_to_vec(),
            Message::Index(m) => m.encode_to_vec(),
            Message::IndexUpdate(m) => m.encode_to_vec(),
            Message::Request(m) => m.encode_to_vec(),
            Message::Response(m) => m.encode_to_vec(),
            Message::DownloadProgress(m) => m.encode_to_vec(),
            Message::Ping(m) => m.encode_to_vec(),
            Message::Close(m) => m.encode_to_vec(),
        }
    }

    /// Decodes an uncompressed payload of the given type.
    pub fn decode_payload(message_type: MessageType, payload: &[u8]) -> Result<Self, ProtoError> {
        Ok(match message_type {
            MessageType::ClusterConfig => Message::ClusterConfig(ClusterConfig::decode(payload)?),
            MessageType::Index => Message::Index(Index::decode(payload)?),
            MessageType::IndexUpdate => Message::IndexUpdate(IndexUpdate::decode(payload)?),
            MessageType::Request => Message::Request(Request::decode(payload)?),
            MessageType::Response => Message::Response(Response::decode(payload)?),
            MessageType::DownloadProgress => {
                Message::DownloadProgress(DownloadProgress::decode(payload)?)
            }
            MessageType::Ping => Message::Ping(Ping::decode(payload)?),
            MessageType::Close => Message::Close(Close::decode(payload)?),
        })
    }
}

macro_rules! impl_from {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Message {
                fn from(message: $variant) -> Self {
                    Message::$variant(message)
                }
            }
        )*
    };
}

impl_from!(ClusterConfig, Index, IndexUpdate, Request, Response, DownloadProgress, Ping, Close);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bep::ErrorCode;

    #[test]
    fn test_message_type() {
        assert_eq!(Message::from(Ping {}).message_type(), MessageType::Ping);
        assert_eq!(
            Message::from(Close { reason: "bye".into() }).message_type(),
            MessageType::Close
        );
    }

    #[test]
    fn test_payload_roundtrip() {
        let response = Message::from(Response {
            id: 42,
            data: vec![1, 2, 3],
            code: ErrorCode::NoSuchFile as i32,
        });
        let payload = response.encode_payload();
        let decoded = Message::decode_payload(MessageType::Response, &payload).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_empty_ping_payload() {
        let payload = Message::from(Ping {}).encode_payload();
        assert!(payload.is_empty());
        assert_eq!(
            Message::decode_payload(MessageType::Ping, &payload).unwrap(),
            Message::Ping(Ping {})
        );
    }

    #[test]
    fn test_garbage_payload() {
        let result = Message::decode_payload(MessageType::Request, &[0xFF, 0xFF, 0xFF]);
        assert!(matches!(result, Err(ProtoError::Decode(_))));
    }
}
