// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Little-endian byte cursors used by every on-the-wire structure.
//!
//! Registration samples, UDP payload datagrams, TCP payload frames and
//! service requests are all written with [`WireWriter`] and read back with
//! [`WireReader`]. Strings and byte blobs carry a `u32` length prefix.

use std::fmt;

/// Errors raised while decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the value could be read
    Truncated { offset: usize, needed: usize },
    /// Leading magic does not match the expected value
    BadMagic { expected: u32, found: u32 },
    /// Protocol version is newer than this implementation
    UnsupportedVersion(u16),
    /// Discriminant byte does not name a known variant
    UnknownKind { what: &'static str, value: u8 },
    /// String field is not valid UTF-8
    InvalidUtf8 { offset: usize },
    /// Length prefix exceeds the allowed maximum
    TooLarge { len: usize, max: usize },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset, needed } => {
                write!(f, "truncated input at offset {}: {} more bytes needed", offset, needed)
            }
            Self::BadMagic { expected, found } => {
                write!(f, "bad magic: expected {:#010x}, found {:#010x}", expected, found)
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            Self::UnknownKind { what, value } => write!(f, "unknown {} discriminant {}", what, value),
            Self::InvalidUtf8 { offset } => write!(f, "invalid UTF-8 string at offset {}", offset),
            Self::TooLarge { len, max } => write!(f, "length {} exceeds maximum {}", len, max),
        }
    }
}

impl std::error::Error for WireError {}

/// Result alias for wire decoding
pub type WireResult<T> = Result<T, WireError>;

/// Largest string or blob accepted by [`WireReader`] (64 MiB).
pub const MAX_BLOB_LEN: usize = 64 * 1024 * 1024;

macro_rules! impl_put_le {
    ($name:ident, $type:ty) => {
        pub fn $name(&mut self, value: $type) -> &mut Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }
    };
}

macro_rules! impl_get_le {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> WireResult<$type> {
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(self.take($size)?);
            Ok(<$type>::from_le_bytes(bytes))
        }
    };
}

/// Growable little-endian writer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    impl_put_le!(put_u16, u16);
    impl_put_le!(put_u32, u32);
    impl_put_le!(put_u64, u64);
    impl_put_le!(put_i32, i32);
    impl_put_le!(put_i64, i64);

    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u8(u8::from(value))
    }

    /// Length-prefixed UTF-8 string
    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_blob(value.as_bytes())
    }

    /// Length-prefixed byte blob
    pub fn put_blob(&mut self, value: &[u8]) -> &mut Self {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
        self
    }

    /// Raw bytes without a length prefix
    pub fn put_raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked little-endian reader over a borrowed buffer.
pub struct WireReader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    impl_get_le!(get_u16, u16, 2);
    impl_get_le!(get_u32, u32, 4);
    impl_get_le!(get_u64, u64, 8);
    impl_get_le!(get_i32, i32, 4);
    impl_get_le!(get_i64, i64, 8);

    pub fn get_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> WireResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_blob(&mut self) -> WireResult<&'a [u8]> {
        let len = self.get_u32()? as usize;
        if len > MAX_BLOB_LEN {
            return Err(WireError::TooLarge {
                len,
                max: MAX_BLOB_LEN,
            });
        }
        self.take(len)
    }

    pub fn get_string(&mut self) -> WireResult<String> {
        let offset = self.offset;
        let bytes = self.get_blob()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8 { offset })
    }

    /// Check a leading magic value.
    pub fn expect_magic(&mut self, expected: u32) -> WireResult<()> {
        let found = self.get_u32()?;
        if found != expected {
            return Err(WireError::BadMagic { expected, found });
        }
        Ok(())
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.offset..];
        self.offset = self.buf.len();
        rest
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.offset)
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.buf.len()
    }

    fn take(&mut self, len: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                offset: self.offset,
                needed: len - self.remaining(),
            });
        }
        let slice = &self.buf[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_reader_mixed_fields() {
        let mut w = WireWriter::new();
        w.put_u32(0xABCD_0001)
            .put_u8(7)
            .put_bool(true)
            .put_i64(-42)
            .put_str("topic/a")
            .put_blob(&[])
            .put_u16(9);
        let bytes = w.into_inner();

        let mut r = WireReader::new(&bytes);
        r.expect_magic(0xABCD_0001).expect("magic");
        assert_eq!(r.get_u8().expect("u8"), 7);
        assert!(r.get_bool().expect("bool"));
        assert_eq!(r.get_i64().expect("i64"), -42);
        assert_eq!(r.get_string().expect("string"), "topic/a");
        assert!(r.get_blob().expect("blob").is_empty());
        assert_eq!(r.get_u16().expect("u16"), 9);
        assert!(r.is_eof());
    }

    #[test]
    fn test_truncated_reports_offset() {
        let bytes = [1u8, 2, 3];
        let mut r = WireReader::new(&bytes);
        let err = r.get_u32().unwrap_err();
        assert_eq!(err, WireError::Truncated { offset: 0, needed: 1 });
    }

    #[test]
    fn test_bad_magic() {
        let mut w = WireWriter::new();
        w.put_u32(1);
        let bytes = w.into_inner();
        let err = WireReader::new(&bytes).expect_magic(2).unwrap_err();
        assert!(matches!(err, WireError::BadMagic { expected: 2, found: 1 }));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut w = WireWriter::new();
        w.put_blob(&[0xFF, 0xFE]);
        let bytes = w.into_inner();
        let err = WireReader::new(&bytes).get_string().unwrap_err();
        assert_eq!(err, WireError::InvalidUtf8 { offset: 0 });
    }

    #[test]
    fn test_oversized_blob_rejected() {
        let mut w = WireWriter::new();
        w.put_u32(u32::MAX);
        let bytes = w.into_inner();
        let err = WireReader::new(&bytes).get_blob().unwrap_err();
        assert!(matches!(err, WireError::TooLarge { .. }));
    }
}
