// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared memory layer for same-host delivery.
//!
//! Each publisher owns one or more memfiles (POSIX shared memory objects).
//! A memfile is a fixed header followed by the payload of the latest
//! sample; subscribers on the same host map it and wait on its
//! notification word.
//!
//! ```text
//! +---------------------+          +---------------------+
//! |   Process A         |  memfile |   Process B         |
//! |   ShmWriter --------+--(mmap)--+--> ShmObserver      |
//! |     write lock      |  futex   |     read lock       |
//! |     publish() ------+--(wake)--+--> sink callback    |
//! |     wait for acks <-+----------+--- acknowledge()    |
//! +---------------------+          +---------------------+
//! ```
//!
//! Zero-copy mode hands the mapped bytes to the receive callback while
//! the read lock is held; otherwise the observer copies first.

mod futex;
#[cfg(target_os = "linux")]
mod memfile;
#[cfg(target_os = "linux")]
mod observer;
#[cfg(target_os = "linux")]
mod segment;
#[cfg(target_os = "linux")]
mod writer;

pub use futex::{futex_wait, futex_wake, futex_wake_all};
#[cfg(target_os = "linux")]
pub use memfile::{MemFile, MemFileHeader, SlotState, MAX_SHM_READERS};
#[cfg(target_os = "linux")]
pub use observer::ShmObserver;
#[cfg(target_os = "linux")]
pub use segment::ShmSegment;
#[cfg(target_os = "linux")]
pub use writer::{ShmWriter, ShmWriterOptions};

#[cfg(not(target_os = "linux"))]
pub use stub::{ShmObserver, ShmWriter, ShmWriterOptions};

use std::fmt;
use std::io;

/// Errors that can occur in SHM layer operations
#[derive(Debug)]
pub enum ShmError {
    /// Shared memory segment creation failed
    SegmentCreate(io::Error),
    /// Shared memory segment open failed
    SegmentOpen(io::Error),
    /// Memory mapping failed
    Mmap(io::Error),
    /// Payload too large for the memfile
    PayloadTooLarge { size: usize, capacity: usize },
    /// Header inconsistent with the mapping
    Corruption,
    /// Invalid segment name
    InvalidName(String),
    /// Segment not found
    NotFound(String),
    BadMagic(u32),
    UnsupportedVersion(u32),
    /// Memfile lock not acquired in time
    LockTimeout,
    /// No shared memory support on this platform
    Unsupported,
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentCreate(e) => write!(f, "Shared memory segment creation failed: {e}"),
            Self::SegmentOpen(e) => write!(f, "Shared memory segment open failed: {e}"),
            Self::Mmap(e) => write!(f, "Memory mapping failed: {e}"),
            Self::PayloadTooLarge { size, capacity } => {
                write!(
                    f,
                    "Payload too large: {size} bytes exceeds memfile capacity {capacity}"
                )
            }
            Self::Corruption => write!(f, "Memfile header corrupted"),
            Self::InvalidName(name) => write!(f, "Invalid segment name: {name}"),
            Self::NotFound(name) => write!(f, "Segment not found: {name}"),
            Self::BadMagic(m) => write!(f, "Bad memfile magic: 0x{m:08x}"),
            Self::UnsupportedVersion(v) => write!(f, "Unsupported memfile version: {v}"),
            Self::LockTimeout => write!(f, "Memfile lock timeout"),
            Self::Unsupported => write!(f, "Shared memory is not supported on this platform"),
        }
    }
}

impl std::error::Error for ShmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentOpen(e) | Self::Mmap(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for SHM operations
pub type Result<T> = std::result::Result<T, ShmError>;

/// SHM stub for non-Linux platforms: constructors fail, the publisher and
/// subscriber then run without this layer.
#[cfg(not(target_os = "linux"))]
mod stub {
    use super::{Result, ShmError};
    use crate::entity::EntityId;
    use crate::pubsub::PayloadWriter;
    use crate::registration::RegistrationSample;
    use crate::transport::{Layer, LayerWriter, SampleSink, WriteContext};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub struct ShmWriterOptions {
        pub buffer_count: usize,
        pub zero_copy: bool,
        pub acknowledge_timeout: Duration,
        pub min_size: usize,
        pub reserve_percent: u32,
    }

    pub struct ShmWriter;

    impl ShmWriter {
        pub fn new(_publisher: &EntityId, _options: ShmWriterOptions) -> Result<Self> {
            Err(ShmError::Unsupported)
        }

        pub fn is_zero_copy(&self) -> bool {
            false
        }

        pub fn write_with(&self, _ctx: &WriteContext<'_>, _p: &mut dyn PayloadWriter) -> bool {
            false
        }

        pub fn reclaim_dead_readers(&self) {}
    }

    impl LayerWriter for ShmWriter {
        fn layer(&self) -> Layer {
            Layer::Shm
        }
        fn write(&self, _ctx: &WriteContext<'_>, _payload: &[u8]) -> bool {
            false
        }
        fn connect(&self, _subscriber: &RegistrationSample) {}
        fn disconnect(&self, _subscriber_id: &EntityId) {}
        fn has_readers(&self) -> bool {
            false
        }
        fn describe(&self, _sample: &mut RegistrationSample) {}
    }

    pub struct ShmObserver;

    impl ShmObserver {
        pub fn start(
            _memfile_name: &str,
            _subscriber_id: u64,
            _publisher: EntityId,
            _topic_name: &str,
            _sink: Arc<dyn SampleSink>,
        ) -> Result<Self> {
            Err(ShmError::Unsupported)
        }
    }
}
