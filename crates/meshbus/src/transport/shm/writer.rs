// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher side of the SHM layer.
//!
//! A writer owns `memfile_buffer_count` memfiles, kept in an index-based
//! arena and used round-robin. One send runs one slot through
//! `Idle -> Writing -> Published -> (AwaitingAck | Idle)`.

use super::memfile::{seq_reached, MemFile, SlotState};
use super::segment::ShmSegment;
use super::{futex_wait, Result};
use crate::config::{SHM_OBSERVER_SLICE_MS, SHM_WRITE_LOCK_TIMEOUT_MS};
use crate::entity::EntityId;
use crate::process;
use crate::pubsub::{BufferPayload, PayloadWriter};
use crate::registration::RegistrationSample;
use crate::transport::{Layer, LayerWriter, WriteContext};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Writer settings taken from the publisher configuration.
#[derive(Debug, Clone)]
pub struct ShmWriterOptions {
    pub buffer_count: usize,
    pub zero_copy: bool,
    pub acknowledge_timeout: Duration,
    pub min_size: usize,
    pub reserve_percent: u32,
}

struct BufferSlot {
    memfile: MemFile,
    /// Size of the last successful write, enables `write_modified`
    last_size: Option<usize>,
}

/// Ack bookkeeping for one matched subscriber.
#[derive(Debug, Clone, Copy)]
struct ReaderPeer {
    ack_valid: bool,
}

pub struct ShmWriter {
    publisher_id: u64,
    slots: Vec<Mutex<BufferSlot>>,
    names: Vec<String>,
    next: AtomicUsize,
    options: ShmWriterOptions,
    readers: Mutex<HashMap<u64, ReaderPeer>>,
}

impl ShmWriter {
    /// Create every memfile up front so their names can be advertised.
    pub fn new(publisher: &EntityId, options: ShmWriterOptions) -> Result<Self> {
        let count = options.buffer_count.max(1);
        let mut slots = Vec::with_capacity(count);
        let mut names: Vec<String> = Vec::with_capacity(count);
        for idx in 0..count {
            let name = memfile_name(publisher, idx);
            let memfile = match MemFile::create(&name, options.min_size, publisher.entity_id) {
                Ok(m) => m,
                Err(e) => {
                    for created in &names {
                        let _ = ShmSegment::unlink(created);
                    }
                    return Err(e);
                }
            };
            memfile
                .header()
                .zero_copy
                .store(u32::from(options.zero_copy), Ordering::Release);
            memfile.header().ack_timeout_ms.store(
                u32::try_from(options.acknowledge_timeout.as_millis()).unwrap_or(u32::MAX),
                Ordering::Release,
            );
            names.push(name);
            slots.push(Mutex::new(BufferSlot {
                memfile,
                last_size: None,
            }));
        }
        Ok(Self {
            publisher_id: publisher.entity_id,
            slots,
            names,
            next: AtomicUsize::new(0),
            options,
            readers: Mutex::new(HashMap::new()),
        })
    }

    pub fn memfile_names(&self) -> &[String] {
        &self.names
    }

    pub fn is_zero_copy(&self) -> bool {
        self.options.zero_copy
    }

    /// Write through a payload writer. In zero-copy mode the writer fills
    /// the mapped bytes directly.
    pub fn write_with(&self, ctx: &WriteContext<'_>, payload: &mut dyn PayloadWriter) -> bool {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let mut slot = self.slots[idx].lock();
        let size = payload.size();

        if !slot
            .memfile
            .header()
            .write_lock(Duration::from_millis(SHM_WRITE_LOCK_TIMEOUT_MS))
        {
            log::warn!(
                "[SHM] write lock timeout on {} (clock {})",
                slot.memfile.name(),
                ctx.send_clock
            );
            return false;
        }
        slot.memfile.header().set_slot_state(SlotState::Writing);

        if size > slot.memfile.capacity() {
            let reserve = size * self.options.reserve_percent as usize / 100;
            if let Err(e) = slot.memfile.grow(size + reserve) {
                log::warn!("[SHM] cannot grow {}: {}", slot.memfile.name(), e);
                let header = slot.memfile.header();
                header.set_slot_state(SlotState::Idle);
                header.write_unlock();
                return false;
            }
            slot.last_size = None;
        }

        // SAFETY: write lock held and size <= capacity after grow
        let data = unsafe { slot.memfile.payload_mut(size) };
        let written = if self.options.zero_copy && slot.last_size == Some(size) {
            payload.write_modified(data)
        } else {
            payload.write_full(data)
        };

        let header = slot.memfile.header();
        if !written {
            log::warn!("[SHM] payload writer failed (clock {})", ctx.send_clock);
            header.set_slot_state(SlotState::Idle);
            header.write_unlock();
            slot.last_size = None;
            return false;
        }

        header.data_size.store(size as u64, Ordering::Release);
        header.clock.store(ctx.send_clock, Ordering::Release);
        header.send_time_us.store(ctx.send_time_us, Ordering::Release);
        header.publisher_id.store(self.publisher_id, Ordering::Release);
        header.set_slot_state(SlotState::Published);
        header.write_unlock();
        let seq = header.publish();

        if !self.options.acknowledge_timeout.is_zero() {
            header.set_slot_state(SlotState::AwaitingAck);
            self.wait_for_acks(&slot.memfile, seq);
        }
        header.set_slot_state(SlotState::Idle);
        slot.last_size = Some(size);
        true
    }

    /// Wait until every ack-valid attached reader finished generation
    /// `seq`. One deadline bounds the whole wait.
    fn wait_for_acks(&self, memfile: &MemFile, seq: u32) {
        let deadline = Instant::now() + self.options.acknowledge_timeout;
        let slice = Duration::from_millis(SHM_OBSERVER_SLICE_MS);
        let header = memfile.header();

        for reader in &header.readers {
            let owner = reader.owner.load(Ordering::Acquire);
            if owner == 0 || !self.is_ack_valid(owner) {
                continue;
            }
            loop {
                let ack = reader.ack_seq.load(Ordering::Acquire);
                if seq_reached(ack, seq) || reader.owner.load(Ordering::Acquire) != owner {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    log::warn!(
                        "[SHM] ack timeout for reader {} on {} after {:?}",
                        owner,
                        memfile.name(),
                        self.options.acknowledge_timeout
                    );
                    self.invalidate_ack(owner);
                    break;
                }
                futex_wait(&reader.ack_seq, ack, Some((deadline - now).min(slice)));
            }
        }
    }

    fn is_ack_valid(&self, owner: u64) -> bool {
        self.readers
            .lock()
            .get(&owner)
            .is_some_and(|peer| peer.ack_valid)
    }

    fn invalidate_ack(&self, owner: u64) {
        if let Some(peer) = self.readers.lock().get_mut(&owner) {
            peer.ack_valid = false;
        }
    }

    /// Free reader slots held by processes that no longer exist.
    pub fn reclaim_dead_readers(&self) {
        for slot in &self.slots {
            let slot = slot.lock();
            let reclaimed = slot.memfile.header().reclaim_dead_readers();
            if reclaimed > 0 {
                log::debug!(
                    "[SHM] reclaimed {} dead reader slot(s) on {}",
                    reclaimed,
                    slot.memfile.name()
                );
            }
        }
    }
}

impl LayerWriter for ShmWriter {
    fn layer(&self) -> Layer {
        Layer::Shm
    }

    fn write(&self, ctx: &WriteContext<'_>, payload: &[u8]) -> bool {
        self.write_with(ctx, &mut BufferPayload::new(payload))
    }

    /// Every refresh of a matched subscriber re-validates its ack state.
    fn connect(&self, subscriber: &RegistrationSample) {
        if !subscriber.entity.is_local_host() {
            return;
        }
        let mut readers = self.readers.lock();
        let peer = readers
            .entry(subscriber.entity.entity_id)
            .or_insert(ReaderPeer { ack_valid: true });
        if !peer.ack_valid {
            log::debug!(
                "[SHM] reader {} re-validated for acknowledgement",
                subscriber.entity
            );
            peer.ack_valid = true;
        }
    }

    fn disconnect(&self, subscriber_id: &EntityId) {
        self.readers.lock().remove(&subscriber_id.entity_id);
    }

    fn has_readers(&self) -> bool {
        !self.readers.lock().is_empty()
    }

    fn describe(&self, sample: &mut RegistrationSample) {
        sample.shm_memfiles = self.names.clone();
    }
}

impl Drop for ShmWriter {
    fn drop(&mut self) {
        for name in &self.names {
            if let Err(e) = ShmSegment::unlink(name) {
                log::debug!("[SHM] unlink {} failed: {}", name, e);
            }
        }
    }
}

fn memfile_name(publisher: &EntityId, idx: usize) -> String {
    format!(
        "/mb_{}_{:x}_{}",
        process::process_id(),
        publisher.entity_id,
        idx
    )
}
