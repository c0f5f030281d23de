// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Measurement contract: what a persistence backend must implement to
//! store recorded channels.
//!
//! [`Recorder`] subscribes to a set of channels and hands every received
//! sample to a [`MeasurementWriter`]. File formats are the backend's
//! business; [`MemoryMeasurement`] keeps everything in memory.

use crate::callback::ReceiveData;
use crate::config::SubscriberConfig;
use crate::context::Context;
use crate::entity::{DataTypeInformation, TopicId};
use crate::error::Result;
use crate::process;
use crate::pubsub::Subscriber;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One recorded sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterEntry {
    pub channel: String,
    pub payload: Vec<u8>,
    /// Publisher send time, microseconds since the Unix epoch
    pub send_timestamp: i64,
    /// Local receive time, microseconds since the Unix epoch
    pub receive_timestamp: i64,
    pub clock: u64,
}

/// Storage backend for recorded channels.
pub trait MeasurementWriter: Send + 'static {
    fn set_channel_data_type_information(&mut self, channel: &str, data_type: &DataTypeInformation);

    /// Store one entry. `false` when the backend rejected it.
    fn add_entry_to_file(&mut self, entry: WriterEntry) -> bool;
}

/// In-memory backend, optionally bounded.
#[derive(Debug, Default)]
pub struct MemoryMeasurement {
    channels: BTreeMap<String, DataTypeInformation>,
    entries: Vec<WriterEntry>,
    max_entries: Option<usize>,
}

impl MemoryMeasurement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that rejects entries beyond `max_entries`.
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    pub fn channels(&self) -> &BTreeMap<String, DataTypeInformation> {
        &self.channels
    }

    pub fn entries(&self) -> &[WriterEntry] {
        &self.entries
    }

    pub fn entries_for<'a>(&'a self, channel: &'a str) -> impl Iterator<Item = &'a WriterEntry> {
        self.entries.iter().filter(move |e| e.channel == channel)
    }
}

impl MeasurementWriter for MemoryMeasurement {
    fn set_channel_data_type_information(&mut self, channel: &str, data_type: &DataTypeInformation) {
        self.channels.insert(channel.to_string(), data_type.clone());
    }

    fn add_entry_to_file(&mut self, entry: WriterEntry) -> bool {
        if self.max_entries.is_some_and(|max| self.entries.len() >= max) {
            return false;
        }
        self.entries.push(entry);
        true
    }
}

/// Recording statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingStats {
    pub message_count: u64,
    pub bytes_written: u64,
    /// Entries the backend refused
    pub rejected: u64,
}

#[derive(Default)]
struct StatCounters {
    message_count: AtomicU64,
    bytes_written: AtomicU64,
    rejected: AtomicU64,
}

/// Records channels into a [`MeasurementWriter`].
pub struct Recorder<W: MeasurementWriter> {
    ctx: Context,
    /// Taken out by `finish`
    writer: Arc<Mutex<Option<W>>>,
    subscribers: Vec<Subscriber>,
    stats: Arc<StatCounters>,
}

impl<W: MeasurementWriter> Recorder<W> {
    pub fn new(ctx: &Context, writer: W) -> Self {
        Self {
            ctx: ctx.clone(),
            writer: Arc::new(Mutex::new(Some(writer))),
            subscribers: Vec::new(),
            stats: Arc::new(StatCounters::default()),
        }
    }

    /// Start recording `channel`. The data type is announced to the
    /// backend before the first entry.
    pub fn add_channel(&mut self, channel: &str, data_type: DataTypeInformation) -> Result<()> {
        let subscriber = Subscriber::new(
            &self.ctx,
            channel,
            data_type.clone(),
            SubscriberConfig::default(),
        )?;
        let channel_name = subscriber.topic_name().to_string();
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.set_channel_data_type_information(&channel_name, &data_type);
        }

        let writer = Arc::clone(&self.writer);
        let stats = Arc::clone(&self.stats);
        subscriber.set_receive_callback(
            move |_: &TopicId, _: &DataTypeInformation, data: &ReceiveData<'_>| {
                let entry = WriterEntry {
                    channel: channel_name.clone(),
                    payload: data.buffer.to_vec(),
                    send_timestamp: data.send_timestamp,
                    receive_timestamp: process::now_us(),
                    clock: data.send_clock,
                };
                let len = entry.payload.len() as u64;
                let stored = writer
                    .lock()
                    .as_mut()
                    .is_some_and(|w| w.add_entry_to_file(entry));
                if stored {
                    stats.message_count.fetch_add(1, Ordering::Relaxed);
                    stats.bytes_written.fetch_add(len, Ordering::Relaxed);
                } else {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                }
            },
        );
        log::debug!("[SUB] recorder attached to channel '{}'", subscriber.topic_name());
        self.subscribers.push(subscriber);
        Ok(())
    }

    pub fn channels(&self) -> Vec<&str> {
        self.subscribers.iter().map(|s| s.topic_name()).collect()
    }

    pub fn stats(&self) -> RecordingStats {
        RecordingStats {
            message_count: self.stats.message_count.load(Ordering::Relaxed),
            bytes_written: self.stats.bytes_written.load(Ordering::Relaxed),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }

    /// Run `f` with the backend locked.
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut W) -> R) -> Option<R> {
        self.writer.lock().as_mut().map(f)
    }

    /// Stop every subscription and return the backend.
    pub fn finish(mut self) -> Option<W> {
        self.subscribers.clear();
        self.writer.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PublisherConfig};
    use crate::pubsub::Publisher;
    use std::time::{Duration, Instant};

    #[test]
    fn test_bounded_memory_backend() {
        let mut mem = MemoryMeasurement::bounded(1);
        let entry = |clock| WriterEntry {
            channel: "a".to_string(),
            payload: vec![1],
            send_timestamp: 0,
            receive_timestamp: 0,
            clock,
        };
        assert!(mem.add_entry_to_file(entry(1)));
        assert!(!mem.add_entry_to_file(entry(2)));
        assert_eq!(mem.entries_for("a").count(), 1);
        assert_eq!(mem.entries_for("b").count(), 0);
    }

    #[test]
    fn test_recorder_stores_channel_samples() {
        let mut cfg = Config::default();
        cfg.registration.udp_enable = false;
        cfg.registration.refresh_ms = 50;
        let ctx = Context::new("recorder_unit", cfg).expect("Failed to create context");
        ctx.initialize().expect("Failed to initialize");

        let dti = DataTypeInformation::new("blob", "raw");
        let mut recorder = Recorder::new(&ctx, MemoryMeasurement::new());
        recorder
            .add_channel("rec_channel", dti.clone())
            .expect("Failed to add channel");
        assert_eq!(recorder.channels(), vec!["rec_channel"]);

        let publisher = Publisher::new(&ctx, "rec_channel", dti.clone(), PublisherConfig::default())
            .expect("Failed to create publisher");
        let deadline = Instant::now() + Duration::from_secs(3);
        while publisher.subscriber_count() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(publisher.send(b"abc", 1234));
        while recorder.stats().message_count == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let mem = recorder.finish().expect("Failed to take backend");
        assert_eq!(mem.channels().get("rec_channel"), Some(&dti));
        let entries: Vec<_> = mem.entries_for("rec_channel").collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"abc");
        assert_eq!(entries[0].send_timestamp, 1234);
        assert_eq!(entries[0].clock, 1);
        assert!(entries[0].receive_timestamp > 0);
        ctx.finalize();
    }
}
