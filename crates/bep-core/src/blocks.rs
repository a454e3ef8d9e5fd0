//! Content blocks.
//!
//! Files are split into fixed-size blocks addressed by their SHA-256 hash.
//! The hash of a whole file is derived from its block hashes, never from the
//! file bytes directly.

use std::io::Read;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoding::{DecodeError, RecordDecode, RecordEncode};

/// Fixed block size (128 KiB).
pub const BLOCK_SIZE: usize = 128 * 1024;

/// One content-addressed block of a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Byte offset of the block within the file
    pub offset: u64,
    /// Block length in bytes (at most `BLOCK_SIZE`)
    pub size: u32,
    /// Lowercase hex SHA-256 of the block bytes
    pub hash: String,
}

impl BlockInfo {
    /// Creates a new block descriptor.
    pub fn new(offset: u64, size: u32, hash: impl Into<String>) -> Self {
        Self {
            offset,
            size,
            hash: hash.into(),
        }
    }

    /// Describes the bytes `data` found at `offset`.
    pub fn for_data(offset: u64, data: &[u8]) -> Self {
        Self::new(offset, data.len() as u32, sha256_hex(data))
    }

    /// Returns the raw hash bytes, if the hex form is valid.
    pub fn hash_bytes(&self) -> Option<Vec<u8>> {
        hex::decode(&self.hash).ok()
    }
}

impl RecordEncode for BlockInfo {
    fn encode(&self, buf: &mut BytesMut) {
        self.offset.encode(buf);
        self.size.encode(buf);
        self.hash.encode(buf);
    }
}

impl RecordDecode for BlockInfo {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self {
            offset: u64::decode(buf)?,
            size: u32::decode(buf)?,
            hash: String::decode(buf)?,
        })
    }
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Combines block hashes into the hash of the whole file.
///
/// SHA-256 over the block hashes joined with `,`, as lowercase hex.
pub fn hash_blocks(blocks: &[BlockInfo]) -> String {
    let mut hasher = Sha256::new();
    for (i, block) in blocks.iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(block.hash.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Blocks of an in-memory buffer together with the derived file hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockList {
    /// Blocks in file order
    pub blocks: Vec<BlockInfo>,
    /// Total size in bytes
    pub size: u64,
    /// Derived file hash
    pub hash: String,
}

impl BlockList {
    /// Splits `data` at `BLOCK_SIZE` and hashes every block.
    pub fn from_bytes(data: &[u8]) -> Self {
        let blocks: Vec<BlockInfo> = data
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(|(i, chunk)| BlockInfo::for_data((i * BLOCK_SIZE) as u64, chunk))
            .collect();
        let hash = hash_blocks(&blocks);
        Self {
            blocks,
            size: data.len() as u64,
            hash,
        }
    }

    /// Reads `reader` to the end and splits the result.
    ///
    /// Returns the buffered bytes with the block list, since serving blocks
    /// later needs arbitrary offsets.
    pub fn read_from<R: Read>(mut reader: R) -> std::io::Result<(Bytes, Self)> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let list = Self::from_bytes(&data);
        Ok((Bytes::from(data), list))
    }

    /// Returns true if the list holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
