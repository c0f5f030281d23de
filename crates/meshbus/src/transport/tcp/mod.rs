// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP layer: reliable, ordered stream per (publisher, subscriber) pair.
//!
//! The publisher listens on an ephemeral port advertised in its
//! registration; each matched subscriber connects, sends one hello frame
//! and then receives length-prefixed envelopes.

mod frame_codec;
mod reader;
mod writer;

pub use frame_codec::{FrameCodec, FRAME_HEADER_SIZE};
pub use reader::TcpReader;
pub use writer::TcpWriter;

use crate::wire::{WireReader, WireResult, WireWriter};

const HELLO_MAGIC: u32 = 0x4D42_4831; // "MBH1"
const HELLO_MAX_FRAME: usize = 1024;

/// First frame on every session: who is reading from whom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hello {
    subscriber_id: u64,
    publisher_id: u64,
}

impl Hello {
    fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(20);
        w.put_u32(HELLO_MAGIC)
            .put_u64(self.subscriber_id)
            .put_u64(self.publisher_id);
        w.into_inner()
    }

    fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(buf);
        r.expect_magic(HELLO_MAGIC)?;
        Ok(Self {
            subscriber_id: r.get_u64()?,
            publisher_id: r.get_u64()?,
        })
    }
}
