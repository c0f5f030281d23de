// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram fragmentation for payloads above one UDP datagram.
//!
//! Every datagram carries a fixed header:
//!
//! ```text
//! +--------+-----------+------------+-----------+-------+-------+
//! | "MBF1" | sender_id | message_id | total_len | index | count |
//! |  u32   |    u64    |    u64     |    u32    |  u16  |  u16  |
//! +--------+-----------+------------+-----------+-------+-------+
//! ```
//!
//! Reassembly buffers incomplete messages keyed by (sender, message),
//! bounded in count (LRU eviction) and in age.

use crate::config::{FRAGMENT_BUFFER_SIZE, FRAGMENT_TIMEOUT_MS, UDP_FRAGMENT_PAYLOAD};
use crate::wire::{WireReader, WireResult, WireWriter};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub const FRAGMENT_MAGIC: u32 = 0x4D42_4631; // "MBF1"
pub const FRAGMENT_HEADER_LEN: usize = 4 + 8 + 8 + 4 + 2 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub sender_id: u64,
    pub message_id: u64,
    pub total_len: u32,
    pub index: u16,
    pub count: u16,
}

impl FragmentHeader {
    fn write(&self, w: &mut WireWriter) {
        w.put_u32(FRAGMENT_MAGIC)
            .put_u64(self.sender_id)
            .put_u64(self.message_id)
            .put_u32(self.total_len)
            .put_u16(self.index)
            .put_u16(self.count);
    }

    /// Parse a datagram into its header and chunk.
    pub fn parse(datagram: &[u8]) -> WireResult<(Self, &[u8])> {
        let mut r = WireReader::new(datagram);
        r.expect_magic(FRAGMENT_MAGIC)?;
        let header = Self {
            sender_id: r.get_u64()?,
            message_id: r.get_u64()?,
            total_len: r.get_u32()?,
            index: r.get_u16()?,
            count: r.get_u16()?,
        };
        Ok((header, r.rest()))
    }
}

/// Split `message` into datagrams of at most `UDP_FRAGMENT_PAYLOAD` bytes
/// of payload each. An empty message still yields one datagram.
pub fn split(sender_id: u64, message_id: u64, message: &[u8]) -> Vec<Vec<u8>> {
    split_with(sender_id, message_id, message, UDP_FRAGMENT_PAYLOAD)
}

pub fn split_with(sender_id: u64, message_id: u64, message: &[u8], chunk: usize) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if message.is_empty() {
        vec![&[]]
    } else {
        message.chunks(chunk.max(1)).collect()
    };
    let count = chunks.len() as u16;
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, part)| {
            let mut w = WireWriter::with_capacity(FRAGMENT_HEADER_LEN + part.len());
            FragmentHeader {
                sender_id,
                message_id,
                total_len: message.len() as u32,
                index: index as u16,
                count,
            }
            .write(&mut w);
            w.put_raw(part);
            w.into_inner()
        })
        .collect()
}

struct Partial {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    total_len: usize,
    first_seen: Instant,
}

/// Reassembly buffer for fragmented messages.
pub struct Reassembler {
    pending: LruCache<(u64, u64), Partial>,
    timeout: Duration,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(FRAGMENT_BUFFER_SIZE, Duration::from_millis(FRAGMENT_TIMEOUT_MS))
    }
}

impl Reassembler {
    pub fn new(max_pending: usize, timeout: Duration) -> Self {
        let cap = NonZeroUsize::new(max_pending).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: LruCache::new(cap),
            timeout,
        }
    }

    pub fn push(&mut self, header: FragmentHeader, chunk: &[u8]) -> Option<Vec<u8>> {
        self.push_at(header, chunk, Instant::now())
    }

    /// Add one fragment; returns the full message once every part arrived.
    pub fn push_at(
        &mut self,
        header: FragmentHeader,
        chunk: &[u8],
        now: Instant,
    ) -> Option<Vec<u8>> {
        if header.count <= 1 {
            return Some(chunk.to_vec());
        }
        if header.index >= header.count {
            log::debug!(
                "[UDP] fragment index {} out of range (count {})",
                header.index,
                header.count
            );
            return None;
        }
        self.evict_expired(now);

        let key = (header.sender_id, header.message_id);
        if !self.pending.contains(&key) {
            if let Some((evicted, _)) = self.pending.push(
                key,
                Partial {
                    parts: vec![None; header.count as usize],
                    received: 0,
                    total_len: header.total_len as usize,
                    first_seen: now,
                },
            ) {
                if evicted != key {
                    log::debug!("[UDP] fragment buffer full, evicted message {:?}", evicted);
                }
            }
        }
        let partial = self.pending.get_mut(&key)?;
        if partial.parts.len() != header.count as usize {
            log::debug!("[UDP] fragment count mismatch for message {:?}", key);
            self.pending.pop(&key);
            return None;
        }

        let slot = &mut partial.parts[header.index as usize];
        if slot.is_none() {
            *slot = Some(chunk.to_vec());
            partial.received += 1;
        }
        if partial.received < partial.parts.len() {
            return None;
        }

        let partial = self.pending.pop(&key)?;
        let mut message = Vec::with_capacity(partial.total_len);
        for part in partial.parts.into_iter().flatten() {
            message.extend_from_slice(&part);
        }
        if message.len() != partial.total_len {
            log::debug!(
                "[UDP] reassembled length {} != announced {}",
                message.len(),
                partial.total_len
            );
            return None;
        }
        Some(message)
    }

    fn evict_expired(&mut self, now: Instant) {
        let timeout = self.timeout;
        let expired: Vec<(u64, u64)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.first_seen) > timeout)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.pending.pop(&key);
            log::debug!("[UDP] incomplete message {:?} timed out", key);
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
