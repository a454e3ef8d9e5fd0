//! Device identity.
//!
//! A device is identified by the SHA-256 digest of its certificate (DER).
//! The canonical text form is the digest in Base32 (`A-Z2-7`, no padding),
//! split into four 13-character chunks that each get a Luhn mod 32 check
//! character appended, regrouped into eight dash-separated groups of seven:
//!
//! ```text
//! MFZWI3D-BONSGYC-YLTMRWG-C43ENR5-QXGZDMM-FZWI3DP-BONSGYY-LTMRWAD
//! ```

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the raw device hash in bytes.
pub const DEVICE_ID_BYTES: usize = 32;

/// Base32 alphabet (RFC 4648), also used for the Luhn check characters.
const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

const CHUNK_LEN: usize = 13;
const GROUP_LEN: usize = 7;
const GROUP_COUNT: usize = 8;
const TEXT_LEN: usize = GROUP_LEN * GROUP_COUNT + GROUP_COUNT - 1;

/// Errors from parsing or constructing a device id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceIdError {
    /// Raw hash had the wrong length
    #[error("Invalid device hash length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    /// Text form does not match `XXXXXXX-XXXXXXX-...`
    #[error("Device id syntax error: {0}")]
    Syntax(String),

    /// Check characters or Base32 payload do not validate
    #[error("Device id checksum mismatch: {0}")]
    Checksum(String),
}

/// 256-bit device identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId([u8; DEVICE_ID_BYTES]);

impl DeviceId {
    /// Creates a device id from the raw 32-byte hash.
    pub const fn new(hash: [u8; DEVICE_ID_BYTES]) -> Self {
        Self(hash)
    }

    /// Creates a device id from a hash slice, checking its length.
    pub fn from_hash(hash: &[u8]) -> Result<Self, DeviceIdError> {
        let bytes: [u8; DEVICE_ID_BYTES] = hash
            .try_into()
            .map_err(|_| DeviceIdError::InvalidLength(hash.len()))?;
        Ok(Self(bytes))
    }

    /// Derives the device id of a certificate from its DER encoding.
    pub fn from_certificate(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    /// Returns the raw hash.
    pub const fn as_bytes(&self) -> &[u8; DEVICE_ID_BYTES] {
        &self.0
    }

    /// Returns the raw hash as a vector, as carried in protocol messages.
    pub fn to_hash_data(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Returns the first group of the text form.
    pub fn short_id(&self) -> String {
        let mut text = self.to_string();
        text.truncate(GROUP_LEN);
        text
    }

    /// Counter id used in version vectors: the first 8 hash bytes, big-endian.
    pub fn counter_id(&self) -> u64 {
        let mut head = [0u8; 8];
        head.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(head)
    }

    fn encode(&self) -> String {
        let base32 = BASE32_NOPAD.encode(&self.0);
        let mut checked = String::with_capacity(GROUP_LEN * GROUP_COUNT);
        for chunk in base32.as_bytes().chunks(CHUNK_LEN) {
            // Alphabet output is ASCII, so the chunk is valid UTF-8.
            let chunk = std::str::from_utf8(chunk).unwrap_or_default();
            checked.push_str(chunk);
            checked.push(luhn32(chunk).unwrap_or('A'));
        }

        let mut text = String::with_capacity(TEXT_LEN);
        for (i, group) in checked.as_bytes().chunks(GROUP_LEN).enumerate() {
            if i > 0 {
                text.push('-');
            }
            text.push_str(std::str::from_utf8(group).unwrap_or_default());
        }
        text
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let groups: Vec<&str> = s.split('-').collect();
        let well_formed = s.len() == TEXT_LEN
            && groups.len() == GROUP_COUNT
            && groups.iter().all(|g| {
                g.len() == GROUP_LEN
                    && g.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
            });
        if !well_formed {
            return Err(DeviceIdError::Syntax(s.to_string()));
        }

        // Each 13-character chunk spans two groups; the second group's last
        // character is the check character.
        let joined: String = groups.concat();
        let mut base32 = String::with_capacity(CHUNK_LEN * 4);
        for chunk in joined.as_bytes().chunks(CHUNK_LEN + 1) {
            base32.push_str(std::str::from_utf8(&chunk[..CHUNK_LEN]).unwrap_or_default());
        }

        let hash = BASE32_NOPAD
            .decode(base32.as_bytes())
            .map_err(|_| DeviceIdError::Checksum(s.to_string()))?;
        if hash.len() != DEVICE_ID_BYTES {
            return Err(DeviceIdError::Checksum(s.to_string()));
        }
        let id = Self::from_hash(&hash)?;

        if id.encode() != s {
            return Err(DeviceIdError::Checksum(s.to_string()));
        }
        Ok(id)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short_id())
    }
}

impl From<[u8; DEVICE_ID_BYTES]> for DeviceId {
    fn from(hash: [u8; DEVICE_ID_BYTES]) -> Self {
        Self(hash)
    }
}

impl AsRef<[u8]> for DeviceId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for DeviceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

fn alphabet_index(c: u8) -> Option<u32> {
    ALPHABET.iter().position(|&a| a == c).map(|i| i as u32)
}

/// Luhn mod 32 check character over a run of alphabet characters.
fn luhn32(s: &str) -> Option<char> {
    let n = ALPHABET.len() as u32;
    let mut factor = 1;
    let mut sum = 0;
    for c in s.bytes() {
        let index = alphabet_index(c)?;
        let mut add = factor * index;
        factor = if factor == 2 { 1 } else { 2 };
        add = add / n + add % n;
        sum += add;
    }
    let check = (n - sum % n) % n;
    Some(ALPHABET[check as usize] as char)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_id() -> DeviceId {
        let mut hash = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut hash);
        DeviceId::new(hash)
    }

    #[test]
    fn test_known_hash_text_form() {
        // 32 zero bytes: 52 'A's, each chunk of 'A's checks to 'A'
        let id = DeviceId::new([0; 32]);
        assert_eq!(id.to_string(), "AAAAAAA-AAAAAAA-AAAAAAA-AAAAAAA-AAAAAAA-AAAAAAA-AAAAAAA-AAAAAAA");
        assert_eq!(id.to_string().parse::<DeviceId>().unwrap(), id);
    }

    #[test]
    fn test_non_canonical_trailing_bits_rejected() {
        // the 52nd base32 character carries 4 padding bits that must be zero
        let text = DeviceId::new([0; 32]).to_string();
        let mut chars: Vec<char> = text.chars().collect();
        let last_data = chars.len() - 2;
        chars[last_data] = 'B';
        let tampered: String = chars.into_iter().collect();
        assert!(tampered.parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_text_form_layout() {
        let text = random_id().to_string();
        assert_eq!(text.len(), 63);
        let groups: Vec<&str> = text.split('-').collect();
        assert_eq!(groups.len(), 8);
        assert!(groups.iter().all(|g| g.len() == 7));
    }

    #[test]
    fn test_roundtrip() {
        for _ in 0..64 {
            let id = random_id();
            let parsed: DeviceId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
            assert_eq!(parsed.as_bytes(), id.as_bytes());
        }
    }

    #[test]
    fn test_every_chunk_checksum_validates() {
        let id = random_id();
        let joined: String = id.to_string().split('-').collect();
        for chunk in joined.as_bytes().chunks(14) {
            let data = std::str::from_utf8(&chunk[..13]).unwrap();
            assert_eq!(luhn32(data).unwrap(), chunk[13] as char);
        }
    }

    #[test]
    fn test_single_character_corruption_rejected() {
        let id = random_id();
        let text = id.to_string();
        for (pos, original) in text.char_indices() {
            if original == '-' {
                continue;
            }
            for replacement in ['A', 'Q', '7', '0'] {
                if replacement == original {
                    continue;
                }
                let mut corrupted = text.clone();
                corrupted.replace_range(pos..pos + 1, &replacement.to_string());
                assert!(
                    corrupted.parse::<DeviceId>().is_err(),
                    "corruption at {pos} accepted: {corrupted}"
                );
            }
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(matches!("".parse::<DeviceId>(), Err(DeviceIdError::Syntax(_))));
        assert!(matches!(
            "abcdefg-abcdefg-abcdefg-abcdefg-abcdefg-abcdefg-abcdefg-abcdefg".parse::<DeviceId>(),
            Err(DeviceIdError::Syntax(_))
        ));
        let text = random_id().to_string().replace('-', "");
        assert!(text.parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_from_hash_length() {
        assert_eq!(DeviceId::from_hash(&[1u8; 31]), Err(DeviceIdError::InvalidLength(31)));
        assert!(DeviceId::from_hash(&[1u8; 32]).is_ok());
    }

    #[test]
    fn test_short_id_and_counter() {
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
        let id = DeviceId::new(hash);
        assert_eq!(id.counter_id(), 0x0102_0304_0506_0708);
        assert_eq!(id.short_id(), id.to_string()[..7]);
    }

    #[test]
    fn test_certificate_hash() {
        let der = b"not really a certificate";
        let id = DeviceId::from_certificate(der);
        assert_eq!(id.as_bytes()[..], Sha256::digest(der)[..]);
    }
}
