// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload writers: how a send fills its destination buffer.

/// Fills a destination buffer of exactly `size()` bytes.
///
/// The SHM layer hands the mapped memfile bytes to the writer, so a
/// zero-copy publisher serializes straight into shared memory. When the
/// previous write to the same memfile had the same size,
/// `write_modified` is called instead of `write_full` and may update the
/// buffer in place.
pub trait PayloadWriter {
    /// Write the complete payload. Returns `false` to abort the send.
    fn write_full(&mut self, buf: &mut [u8]) -> bool;

    /// Update a buffer that still holds the previous payload.
    fn write_modified(&mut self, buf: &mut [u8]) -> bool {
        self.write_full(buf)
    }

    /// Exact payload size in bytes.
    fn size(&self) -> usize;
}

/// Payload writer over an existing byte slice.
pub struct BufferPayload<'a> {
    data: &'a [u8],
}

impl<'a> BufferPayload<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl PayloadWriter for BufferPayload<'_> {
    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        if buf.len() != self.data.len() {
            return false;
        }
        buf.copy_from_slice(self.data);
        true
    }

    fn size(&self) -> usize {
        self.data.len()
    }
}

/// Materialize a payload writer into an owned buffer.
pub(crate) fn to_vec(payload: &mut dyn PayloadWriter) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; payload.size()];
    payload.write_full(&mut buf).then_some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        value: u32,
        full: usize,
        modified: usize,
    }

    impl PayloadWriter for Counter {
        fn write_full(&mut self, buf: &mut [u8]) -> bool {
            self.full += 1;
            buf.copy_from_slice(&self.value.to_le_bytes());
            true
        }

        fn write_modified(&mut self, buf: &mut [u8]) -> bool {
            self.modified += 1;
            buf[0] = self.value as u8;
            true
        }

        fn size(&self) -> usize {
            4
        }
    }

    #[test]
    fn test_buffer_payload_copies_exact_size() {
        let mut p = BufferPayload::new(b"abc");
        let mut out = [0u8; 3];
        assert!(p.write_full(&mut out));
        assert_eq!(&out, b"abc");
        let mut wrong = [0u8; 4];
        assert!(!p.write_full(&mut wrong));
    }

    #[test]
    fn test_to_vec_uses_full_write() {
        let mut c = Counter {
            value: 0x0102_0304,
            full: 0,
            modified: 0,
        };
        assert_eq!(to_vec(&mut c), Some(vec![4, 3, 2, 1]));
        assert_eq!((c.full, c.modified), (1, 0));
    }
}
