//! Per-peer index progress.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::encoding::{DecodeError, RecordDecode, RecordEncode};
use crate::DeviceId;

/// How much of a peer's index for one folder has been applied locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Folder id
    pub folder: String,
    /// Peer device
    pub device_id: DeviceId,
    /// Index id announced by the peer
    pub index_id: u64,
    /// Highest peer sequence applied locally
    pub local_sequence: i64,
    /// Highest sequence the peer reported
    pub max_sequence: i64,
}

impl IndexInfo {
    /// Creates the initial record for a (folder, device) pair.
    pub fn new(folder: impl Into<String>, device_id: DeviceId, index_id: u64) -> Self {
        Self {
            folder: folder.into(),
            device_id,
            index_id,
            local_sequence: 0,
            max_sequence: -1,
        }
    }

    /// Fraction of the peer's index applied, 0 when the peer has no records.
    pub fn completed(&self) -> f64 {
        if self.max_sequence > 0 {
            self.local_sequence as f64 / self.max_sequence as f64
        } else {
            0.0
        }
    }

    /// Returns true once every announced record has been applied.
    pub fn is_acquired(&self) -> bool {
        self.local_sequence >= self.max_sequence
    }
}

impl RecordEncode for IndexInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.folder.encode(buf);
        buf.extend_from_slice(self.device_id.as_bytes());
        self.index_id.encode(buf);
        self.local_sequence.encode(buf);
        self.max_sequence.encode(buf);
    }
}

impl RecordDecode for IndexInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let folder = String::decode(buf)?;
        let mut hash = [0u8; 32];
        for byte in hash.iter_mut() {
            *byte = u8::decode(buf)?;
        }
        Ok(Self {
            folder,
            device_id: DeviceId::new(hash),
            index_id: u64::decode(buf)?,
            local_sequence: i64::decode(buf)?,
            max_sequence: i64::decode(buf)?,
        })
    }
}
