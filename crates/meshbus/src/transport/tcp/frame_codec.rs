// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing shared by the TCP data layer and the service RPC
//! channel.
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Frame body        |
//! +----------------+-------------------+
//! ```
//!
//! The codec keeps partial read state, so a read timeout in the middle
//! of a frame loses nothing: the next `decode` call resumes.
//!
//! ```
//! use meshbus::transport::tcp::FrameCodec;
//! use std::io::Cursor;
//!
//! let frame = FrameCodec::encode(b"sample");
//! let mut codec = FrameCodec::new(1024);
//! let body = codec.decode(&mut Cursor::new(frame)).expect("Failed to decode");
//! assert_eq!(body.as_deref(), Some(&b"sample"[..]));
//! ```

use std::io::{self, Read, Write};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

#[derive(Debug)]
pub struct FrameCodec {
    state: ReadState,
    buffer: Vec<u8>,
    /// Anti-OOM bound on a single frame body
    max_size: usize,
    frames_decoded: u64,
    bytes_decoded: u64,
    frames_rejected: u64,
}

#[derive(Debug, Clone, Copy)]
enum ReadState {
    ReadingLength { bytes_read: usize },
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

impl FrameCodec {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
            frames_rejected: 0,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Whether a frame is partially read.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::ReadingLength { bytes_read } => bytes_read > 0,
            ReadState::ReadingBody { .. } => true,
        }
    }

    /// Returns `[length: u32 BE][body]`.
    pub fn encode(body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        Self::encode_into(body, &mut frame);
        frame
    }

    pub fn encode_into(body: &[u8], buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
    }

    /// Write one frame to a blocking stream.
    pub fn write_frame<W: Write + ?Sized>(writer: &mut W, body: &[u8]) -> io::Result<()> {
        writer.write_all(&(body.len() as u32).to_be_bytes())?;
        writer.write_all(body)?;
        writer.flush()
    }

    /// Try to decode one complete frame.
    ///
    /// - `Ok(Some(body))`: a frame is complete
    /// - `Ok(None)`: no more data right now (WouldBlock or read timeout)
    /// - `Err(UnexpectedEof)`: the peer closed the stream
    /// - `Err(InvalidData)`: the announced length exceeds `max_size`
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            let (target, bytes_read) = match self.state {
                ReadState::ReadingLength { bytes_read } => (FRAME_HEADER_SIZE, bytes_read),
                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => (expected_len, bytes_read),
            };

            let n = match reader.read(&mut self.buffer[bytes_read..target]) {
                Ok(0) => {
                    let msg = match self.state {
                        ReadState::ReadingLength { bytes_read: 0 } => "connection closed",
                        ReadState::ReadingLength { .. } => "incomplete frame header",
                        ReadState::ReadingBody { .. } => "incomplete frame body",
                    };
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
                }
                Ok(n) => n,
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            let total = bytes_read + n;

            match self.state {
                ReadState::ReadingLength { .. } if total < FRAME_HEADER_SIZE => {
                    self.state = ReadState::ReadingLength { bytes_read: total };
                }
                ReadState::ReadingLength { .. } => {
                    let len = u32::from_be_bytes([
                        self.buffer[0],
                        self.buffer[1],
                        self.buffer[2],
                        self.buffer[3],
                    ]) as usize;
                    if len > self.max_size {
                        self.frames_rejected += 1;
                        self.state = ReadState::default();
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame too large: {} bytes (max {})", len, self.max_size),
                        ));
                    }
                    if len == 0 {
                        self.frames_decoded += 1;
                        self.state = ReadState::default();
                        return Ok(Some(Vec::new()));
                    }
                    self.buffer.resize(len, 0);
                    self.state = ReadState::ReadingBody {
                        expected_len: len,
                        bytes_read: 0,
                    };
                }
                ReadState::ReadingBody { expected_len, .. } if total < expected_len => {
                    self.state = ReadState::ReadingBody {
                        expected_len,
                        bytes_read: total,
                    };
                }
                ReadState::ReadingBody { expected_len, .. } => {
                    let body = self.buffer[..expected_len].to_vec();
                    self.frames_decoded += 1;
                    self.bytes_decoded += expected_len as u64;
                    self.buffer.resize(FRAME_HEADER_SIZE, 0);
                    self.state = ReadState::default();
                    return Ok(Some(body));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Yields its chunks one `read` at a time, then WouldBlock.
    struct Trickle {
        chunks: Vec<Vec<u8>>,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.chunks.is_empty() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "later"));
            }
            let chunk = &mut self.chunks[0];
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk.drain(..n);
            if chunk.is_empty() {
                self.chunks.remove(0);
            }
            Ok(n)
        }
    }

    #[test]
    fn test_decode_multiple_and_stats() {
        let mut buf = Vec::new();
        FrameCodec::encode_into(b"first", &mut buf);
        FrameCodec::encode_into(b"", &mut buf);
        FrameCodec::encode_into(b"third!", &mut buf);
        let mut cursor = Cursor::new(buf);
        let mut codec = FrameCodec::new(1024);

        assert_eq!(
            codec.decode(&mut cursor).expect("Failed to decode"),
            Some(b"first".to_vec())
        );
        assert_eq!(codec.decode(&mut cursor).expect("Failed to decode"), Some(Vec::new()));
        assert_eq!(
            codec.decode(&mut cursor).expect("Failed to decode"),
            Some(b"third!".to_vec())
        );
        assert_eq!(codec.frames_decoded(), 3);
        assert_eq!(codec.bytes_decoded(), 11);

        let eof = codec.decode(&mut cursor).expect_err("EOF expected");
        assert_eq!(eof.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_resume_after_would_block() {
        let frame = FrameCodec::encode(b"hello, world!");
        let mut codec = FrameCodec::new(1024);
        let mut src = Trickle {
            chunks: vec![frame[..2].to_vec()],
        };
        assert_eq!(codec.decode(&mut src).expect("Failed to decode"), None);
        assert!(codec.is_partial());

        src.chunks = vec![frame[2..7].to_vec()];
        assert_eq!(codec.decode(&mut src).expect("Failed to decode"), None);

        src.chunks = vec![frame[7..].to_vec()];
        assert_eq!(
            codec.decode(&mut src).expect("Failed to decode"),
            Some(b"hello, world!".to_vec())
        );
        assert!(!codec.is_partial());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::new(10);
        let mut cursor = Cursor::new(FrameCodec::encode(b"this body is too long"));
        let err = codec.decode(&mut cursor).expect_err("Oversized frame accepted");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.frames_rejected(), 1);
    }

    #[test]
    fn test_truncated_body_is_eof() {
        let frame = FrameCodec::encode(b"hello, world!");
        let mut codec = FrameCodec::new(1024);
        let err = codec
            .decode(&mut Cursor::new(&frame[..8]))
            .expect_err("Truncated frame accepted");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_write_frame_matches_encode() {
        let mut out = Vec::new();
        FrameCodec::write_frame(&mut out, b"abc").expect("Failed to write frame");
        assert_eq!(out, FrameCodec::encode(b"abc"));
    }
}
