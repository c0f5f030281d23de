// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber side of the SHM layer: one observer thread per matched
//! memfile.

use super::futex_wait;
use super::memfile::MemFile;
use super::Result;
use crate::config::{SHM_OBSERVER_SLICE_MS, SHM_READ_LOCK_TIMEOUT_MS};
use crate::entity::EntityId;
use crate::process;
use crate::transport::{EnvelopeHeader, Layer, SampleSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Watches one memfile and forwards each new sample to the sink.
pub struct ShmObserver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    memfile_name: String,
}

impl ShmObserver {
    /// Open `memfile_name`, claim a reader slot and start observing.
    pub fn start(
        memfile_name: &str,
        subscriber_id: u64,
        publisher: EntityId,
        topic_name: &str,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self> {
        let memfile = MemFile::open(memfile_name)?;
        let slot = memfile
            .header()
            .claim_reader_slot(subscriber_id, process::process_id());
        if slot.is_none() {
            log::warn!(
                "[SHM] no free reader slot on {}, observing without acknowledgement",
                memfile_name
            );
        }

        // Samples published before the match are not replayed.
        let seen_seq = memfile.header().notify_seq.load(Ordering::Acquire);
        let stop = Arc::new(AtomicBool::new(false));
        let state = ObserverState {
            memfile,
            slot,
            seen_seq,
            subscriber_id,
            last_clock: None,
            header: EnvelopeHeader {
                publisher_id: publisher,
                topic_name: topic_name.to_string(),
                send_time_us: 0,
                send_clock: 0,
            },
        };
        let stop_clone = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("meshbus-shm-obs".to_string())
            .spawn(move || observe_loop(state, &stop_clone, sink.as_ref()))
            .map_err(super::ShmError::SegmentOpen)?;

        log::debug!(
            "[SHM] observing {} (reader slot {:?})",
            memfile_name,
            slot
        );
        Ok(Self {
            stop,
            handle: Some(handle),
            memfile_name: memfile_name.to_string(),
        })
    }

    pub fn memfile_name(&self) -> &str {
        &self.memfile_name
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ShmObserver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ObserverState {
    memfile: MemFile,
    slot: Option<usize>,
    seen_seq: u32,
    subscriber_id: u64,
    last_clock: Option<u64>,
    header: EnvelopeHeader,
}

fn observe_loop(mut state: ObserverState, stop: &AtomicBool, sink: &dyn SampleSink) {
    let slice = Duration::from_millis(SHM_OBSERVER_SLICE_MS);
    let mut seen_seq = state.seen_seq;

    while !stop.load(Ordering::Acquire) {
        let seq = state.memfile.header().notify_seq.load(Ordering::Acquire);
        if seq == seen_seq {
            futex_wait(&state.memfile.header().notify_seq, seen_seq, Some(slice));
            continue;
        }
        seen_seq = seq;
        read_sample(&mut state, sink, seq);
    }

    if let Some(idx) = state.slot {
        state
            .memfile
            .header()
            .release_reader_slot(idx, state.subscriber_id);
    }
    log::debug!("[SHM] observer for {} stopped", state.memfile.name());
}

fn read_sample(state: &mut ObserverState, sink: &dyn SampleSink, seq: u32) {
    if !state
        .memfile
        .header()
        .read_lock(Duration::from_millis(SHM_READ_LOCK_TIMEOUT_MS))
    {
        log::debug!("[SHM] read lock timeout on {}", state.memfile.name());
        return;
    }

    if let Err(e) = state.memfile.sync_mapping() {
        log::warn!("[SHM] remap of {} failed: {}", state.memfile.name(), e);
        state.memfile.header().read_unlock();
        return;
    }

    let header = state.memfile.header();
    let clock = header.clock.load(Ordering::Acquire);
    let size = header.data_size.load(Ordering::Acquire) as usize;
    let zero_copy = header.zero_copy.load(Ordering::Acquire) != 0;
    let ack_enabled = header.ack_timeout_ms.load(Ordering::Acquire) != 0;
    state.header.send_time_us = header.send_time_us.load(Ordering::Acquire);
    state.header.send_clock = clock;

    let fresh = state.last_clock != Some(clock) && size <= state.memfile.capacity();
    if !fresh {
        header.read_unlock();
    } else if zero_copy {
        // SAFETY: read lock held and size checked against the mapping
        let data = unsafe { state.memfile.payload(size) };
        sink.apply_sample(Layer::Shm, &state.header, data);
        header.read_unlock();
    } else {
        // SAFETY: read lock held and size checked against the mapping
        let data = unsafe { state.memfile.payload(size) }.to_vec();
        header.read_unlock();
        sink.apply_sample(Layer::Shm, &state.header, &data);
    }

    if fresh {
        state.last_clock = Some(clock);
    }
    if ack_enabled {
        if let Some(idx) = state.slot {
            state.memfile.header().acknowledge(idx, seq);
        }
    }
}
