// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Memfile: one growable shared memory segment holding a control header
//! followed by the payload of the latest published generation.
//!
//! # Layout
//!
//! ```text
//! +------------------------------+  offset 0
//! | MemFileHeader (repr C)       |
//! |   magic, version             |
//! |   lock        (futex rwlock) |
//! |   notify_seq  (futex)        |
//! |   sizes, clock, send time    |
//! |   slot state, flags          |
//! |   readers[MAX_SHM_READERS]   |
//! +------------------------------+  HEADER_SIZE (64-byte aligned)
//! | payload bytes                |
//! +------------------------------+  segment_size
//! ```
//!
//! The payload region is only touched under the lock: the publisher holds
//! the write side while filling it, observers hold the read side while
//! copying (or, in zero-copy mode, while running the callback).

use super::futex::{futex_wait, futex_wake_all};
use super::segment::ShmSegment;
use super::{Result, ShmError};
use crate::process;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const MEMFILE_MAGIC: u32 = 0x4D42_4D46; // "MBMF"
pub const MEMFILE_VERSION: u32 = 1;

/// Reader slots per memfile.
pub const MAX_SHM_READERS: usize = 32;

const WRITER_BIT: u32 = 1 << 31;

/// Futex wait granularity while spinning on the lock word.
const LOCK_WAIT_SLICE: Duration = Duration::from_millis(5);

/// Buffer slot state machine.
///
/// `Idle -> Writing -> Published -> (AwaitingAck | Idle)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Idle = 0,
    Writing = 1,
    Published = 2,
    AwaitingAck = 3,
}

impl SlotState {
    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => SlotState::Writing,
            2 => SlotState::Published,
            3 => SlotState::AwaitingAck,
            _ => SlotState::Idle,
        }
    }
}

/// One attached observer.
#[repr(C)]
pub struct ReaderSlot {
    /// Subscriber entity id, 0 when free
    pub owner: AtomicU64,
    pub pid: AtomicI32,
    /// Last `notify_seq` value this reader finished with
    pub ack_seq: AtomicU32,
}

#[repr(C)]
pub struct MemFileHeader {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    /// Reader count in the low bits, `WRITER_BIT` while written
    pub lock: AtomicU32,
    /// Bumped once per publish; observers futex-wait on it
    pub notify_seq: AtomicU32,
    /// Total segment size, header included
    pub segment_size: AtomicU64,
    pub data_size: AtomicU64,
    pub clock: AtomicU64,
    pub send_time_us: AtomicI64,
    pub publisher_id: AtomicU64,
    pub ack_timeout_ms: AtomicU32,
    pub zero_copy: AtomicU32,
    pub state: AtomicU32,
    _reserved: AtomicU32,
    pub readers: [ReaderSlot; MAX_SHM_READERS],
}

/// Payload offset: header rounded up to a cache line.
pub const HEADER_SIZE: usize = (std::mem::size_of::<MemFileHeader>() + 63) & !63;

impl MemFileHeader {
    pub fn slot_state(&self) -> SlotState {
        SlotState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_slot_state(&self, state: SlotState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Shared lock with a bounded wait.
    pub fn read_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let v = self.lock.load(Ordering::Acquire);
            if v & WRITER_BIT == 0 {
                if self
                    .lock
                    .compare_exchange_weak(v, v + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            futex_wait(&self.lock, v, Some((deadline - now).min(LOCK_WAIT_SLICE)));
        }
    }

    pub fn read_unlock(&self) {
        let prev = self.lock.fetch_sub(1, Ordering::AcqRel);
        if prev & !WRITER_BIT == 1 {
            futex_wake_all(&self.lock);
        }
    }

    /// Exclusive lock with a bounded wait.
    pub fn write_lock(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self
                .lock
                .compare_exchange_weak(0, WRITER_BIT, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(0) => continue,
                Err(v) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    futex_wait(&self.lock, v, Some((deadline - now).min(LOCK_WAIT_SLICE)));
                }
            }
        }
    }

    pub fn write_unlock(&self) {
        self.lock.store(0, Ordering::Release);
        futex_wake_all(&self.lock);
    }

    /// Bump the generation and wake every observer.
    pub fn publish(&self) -> u32 {
        let seq = self.notify_seq.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        futex_wake_all(&self.notify_seq);
        seq
    }

    /// Claim a free reader slot (or the one this owner already holds).
    ///
    /// Slots of dead processes are reclaimed on the way.
    pub fn claim_reader_slot(&self, owner: u64, pid: i32) -> Option<usize> {
        if let Some(idx) = self
            .readers
            .iter()
            .position(|s| s.owner.load(Ordering::Acquire) == owner)
        {
            return Some(idx);
        }
        for pass in 0..2 {
            for (idx, slot) in self.readers.iter().enumerate() {
                let current = slot.owner.load(Ordering::Acquire);
                let free = current == 0
                    || (pass == 1 && !process::is_process_alive(slot.pid.load(Ordering::Acquire)));
                if !free {
                    continue;
                }
                if slot
                    .owner
                    .compare_exchange(current, owner, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    slot.pid.store(pid, Ordering::Release);
                    slot.ack_seq
                        .store(self.notify_seq.load(Ordering::Acquire), Ordering::Release);
                    return Some(idx);
                }
            }
        }
        None
    }

    pub fn release_reader_slot(&self, idx: usize, owner: u64) {
        if let Some(slot) = self.readers.get(idx) {
            if slot
                .owner
                .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.pid.store(0, Ordering::Release);
                futex_wake_all(&slot.ack_seq);
            }
        }
    }

    /// Free slots whose owning process no longer exists.
    pub fn reclaim_dead_readers(&self) -> usize {
        let mut reclaimed = 0;
        for slot in &self.readers {
            let owner = slot.owner.load(Ordering::Acquire);
            if owner == 0 || process::is_process_alive(slot.pid.load(Ordering::Acquire)) {
                continue;
            }
            if slot
                .owner
                .compare_exchange(owner, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn acknowledge(&self, idx: usize, seq: u32) {
        if let Some(slot) = self.readers.get(idx) {
            slot.ack_seq.store(seq, Ordering::Release);
            futex_wake_all(&slot.ack_seq);
        }
    }
}

/// Whether `ack` is at or past `seq` (wrapping).
#[inline]
pub fn seq_reached(ack: u32, seq: u32) -> bool {
    (ack.wrapping_sub(seq) as i32) >= 0
}

/// A mapped memfile.
pub struct MemFile {
    segment: ShmSegment,
}

impl MemFile {
    /// Create a memfile with room for `capacity` payload bytes.
    pub fn create(name: &str, capacity: usize, publisher_id: u64) -> Result<Self> {
        let segment = ShmSegment::create(name, HEADER_SIZE + capacity)?;
        let file = Self { segment };
        let header = file.header();
        header
            .segment_size
            .store(file.segment.size() as u64, Ordering::Release);
        header.publisher_id.store(publisher_id, Ordering::Release);
        header.version.store(MEMFILE_VERSION, Ordering::Release);
        header.magic.store(MEMFILE_MAGIC, Ordering::Release);
        log::debug!(
            "[SHM] created memfile {} ({} bytes payload)",
            name,
            capacity
        );
        Ok(file)
    }

    /// Open a memfile created by another publisher.
    pub fn open(name: &str) -> Result<Self> {
        let segment = ShmSegment::open(name)?;
        if segment.size() < HEADER_SIZE {
            return Err(ShmError::Corruption);
        }
        let file = Self { segment };
        let header = file.header();
        let magic = header.magic.load(Ordering::Acquire);
        if magic != MEMFILE_MAGIC {
            return Err(ShmError::BadMagic(magic));
        }
        let version = header.version.load(Ordering::Acquire);
        if version != MEMFILE_VERSION {
            return Err(ShmError::UnsupportedVersion(version));
        }
        Ok(file)
    }

    #[inline]
    pub fn header(&self) -> &MemFileHeader {
        // SAFETY: the segment is at least HEADER_SIZE bytes, page aligned,
        // and MemFileHeader consists of atomics only
        unsafe { &*(self.segment.as_ptr() as *const MemFileHeader) }
    }

    pub fn name(&self) -> &str {
        self.segment.name()
    }

    /// Payload bytes available in the current mapping.
    pub fn capacity(&self) -> usize {
        self.segment.size() - HEADER_SIZE
    }

    /// Grow so at least `capacity` payload bytes fit. Owner only, with the
    /// write lock held.
    pub fn grow(&mut self, capacity: usize) -> Result<()> {
        if capacity <= self.capacity() {
            return Ok(());
        }
        self.segment.resize(HEADER_SIZE + capacity)?;
        self.header()
            .segment_size
            .store(self.segment.size() as u64, Ordering::Release);
        log::debug!(
            "[SHM] memfile {} grown to {} bytes payload",
            self.name(),
            capacity
        );
        Ok(())
    }

    /// Follow a writer-side resize. Call with the read lock held.
    pub fn sync_mapping(&mut self) -> Result<bool> {
        let wanted = self.header().segment_size.load(Ordering::Acquire) as usize;
        if wanted <= self.segment.size() {
            return Ok(false);
        }
        self.segment.remap(wanted)?;
        Ok(true)
    }

    /// Payload bytes `[0, len)`.
    ///
    /// # Safety
    ///
    /// Caller holds the read or write lock and `len <= capacity()`.
    pub unsafe fn payload(&self, len: usize) -> &[u8] {
        std::slice::from_raw_parts(self.segment.as_ptr().add(HEADER_SIZE), len)
    }

    /// Mutable payload bytes `[0, len)`.
    ///
    /// # Safety
    ///
    /// Caller holds the write lock and `len <= capacity()`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn payload_mut(&self, len: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.segment.as_ptr().add(HEADER_SIZE), len)
    }
}
