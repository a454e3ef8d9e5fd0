//! Binary record encoding for persisted index data.
//!
//! # Encoding Rules
//!
//! - **Integers**: Little-endian, fixed width
//! - **Booleans**: one byte, `0x00` or `0x01`
//! - **Strings**: u32 byte length followed by UTF-8 bytes
//! - **Options**: `0x00` for None, `0x01` + value for Some
//! - **Sequences**: u32 length prefix followed by elements
//! - **Structs**: fields in declaration order without padding

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Errors while decoding a stored record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes to decode
    #[error("Insufficient bytes: expected {expected}, got {available}")]
    InsufficientBytes {
        /// Expected number of bytes
        expected: usize,
        /// Actually available bytes
        available: usize,
    },

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string: {0}")]
    InvalidUtf8(String),

    /// Invalid enum or flag tag
    #[error("Invalid tag: {0}")]
    InvalidTag(u32),

    /// Bytes left over after the record
    #[error("Trailing bytes after record: {0}")]
    TrailingBytes(usize),

    /// Custom decode error
    #[error("{0}")]
    Custom(String),
}

/// Types that can be written as a stored record.
pub trait RecordEncode {
    /// Appends the encoded value to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Returns the encoded bytes.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Returns the encoded bytes as a Vec.
    fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }
}

/// Types that can be read back from a stored record.
pub trait RecordDecode: Sized {
    /// Decodes a value from the front of `buf`.
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError>;

    /// Decodes a complete record, rejecting trailing bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let value = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }
}

fn ensure(buf: &Bytes, expected: usize) -> Result<(), DecodeError> {
    if buf.remaining() < expected {
        return Err(DecodeError::InsufficientBytes {
            expected,
            available: buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! impl_int {
    ($ty:ty, $put:ident, $get:ident) => {
        impl RecordEncode for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
        }

        impl RecordDecode for $ty {
            fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
                ensure(buf, std::mem::size_of::<$ty>())?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int!(u8, put_u8, get_u8);
impl_int!(u32, put_u32_le, get_u32_le);
impl_int!(i32, put_i32_le, get_i32_le);
impl_int!(u64, put_u64_le, get_u64_le);
impl_int!(i64, put_i64_le, get_i64_le);

impl RecordEncode for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }
}

impl RecordDecode for bool {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidTag(other as u32)),
        }
    }
}

impl RecordEncode for String {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_str().encode(buf);
    }
}

impl RecordEncode for str {
    fn encode(&self, buf: &mut BytesMut) {
        (self.len() as u32).encode(buf);
        buf.put_slice(self.as_bytes());
    }
}

impl RecordDecode for String {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        ensure(buf, len)?;
        let bytes = buf.split_to(len);
        String::from_utf8(bytes.to_vec()).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))
    }
}

impl<T: RecordEncode> RecordEncode for Option<T> {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            None => buf.put_u8(0),
            Some(value) => {
                buf.put_u8(1);
                value.encode(buf);
            }
        }
    }
}

impl<T: RecordDecode> RecordDecode for Option<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        match u8::decode(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(buf)?)),
            other => Err(DecodeError::InvalidTag(other as u32)),
        }
    }
}

impl<T: RecordEncode> RecordEncode for Vec<T> {
    fn encode(&self, buf: &mut BytesMut) {
        (self.len() as u32).encode(buf);
        for item in self {
            item.encode(buf);
        }
    }
}

impl<T: RecordDecode> RecordDecode for Vec<T> {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let len = u32::decode(buf)? as usize;
        // Every element takes at least one byte.
        ensure(buf, len)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_layout_is_little_endian() {
        assert_eq!(0x0102_0304u32.to_vec(), vec![4, 3, 2, 1]);
        assert_eq!((-1i64).to_vec(), vec![0xFF; 8]);
    }

    #[test]
    fn test_string_and_option() {
        let value = Some("dir/file.txt".to_string());
        let bytes = value.to_vec();
        assert_eq!(bytes[0], 1);
        assert_eq!(Option::<String>::from_bytes(&bytes).unwrap(), value);
        assert_eq!(Option::<String>::from_bytes(&[0]).unwrap(), None);
    }

    #[test]
    fn test_insufficient_bytes() {
        let err = u64::from_bytes(&[1, 2, 3]).unwrap_err();
        assert_eq!(
            err,
            DecodeError::InsufficientBytes {
                expected: 8,
                available: 3
            }
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        assert_eq!(u8::from_bytes(&[1, 2]), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_bad_bool_tag() {
        assert_eq!(bool::from_bytes(&[2]), Err(DecodeError::InvalidTag(2)));
    }

    #[test]
    fn test_oversized_sequence_length() {
        let mut buf = BytesMut::new();
        1_000_000u32.encode(&mut buf);
        assert!(Vec::<u64>::from_bytes(&buf).is_err());
    }
}
