// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport layers.
//!
//! Each backend (SHM, UDP, TCP) implements the same contract:
//!
//! - the send side is a [`LayerWriter`] owned by a publisher, invoked once
//!   per logical send with the serialized payload;
//! - the receive side runs on the layer's own background thread(s) and
//!   hands every arriving envelope to a [`SampleSink`].
//!
//! Delivery order from one layer and one publisher follows the send
//! clock. Nothing is promised across layers; the subscriber dedup stage
//! reconciles them.
//!
//! ```text
//!  Publisher::send
//!      |  clock += 1
//!      +--> ShmWriter  --memfile--> ShmObserver  --+
//!      +--> UdpWriter  --datagram-> UdpReceiver  --+--> SampleSink (dedup) --> callback
//!      +--> TcpWriter  --frame----> TcpReader    --+
//! ```

pub mod shm;
pub mod tcp;
pub mod udp;

use crate::entity::EntityId;
use crate::registration::RegistrationSample;
use crate::wire::{WireReader, WireResult, WireWriter};
use std::fmt;

/// One concrete transport backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Layer {
    Shm = 0,
    Udp = 1,
    Tcp = 2,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::Shm, Layer::Udp, Layer::Tcp];

    #[inline]
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Shm => "shm",
            Layer::Udp => "udp",
            Layer::Tcp => "tcp",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of enabled layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LayerSet(u8);

impl LayerSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::from_layers(&Layer::ALL)
    }

    pub fn from_layers(layers: &[Layer]) -> Self {
        let mut set = Self::empty();
        for layer in layers {
            set.insert(*layer);
        }
        set
    }

    pub(crate) fn from_bits(bits: u8) -> Self {
        Self(bits & Self::all_bits())
    }

    pub(crate) fn bits(self) -> u8 {
        self.0
    }

    fn all_bits() -> u8 {
        Layer::ALL.iter().fold(0, |acc, l| acc | l.bit())
    }

    pub fn insert(&mut self, layer: Layer) {
        self.0 |= layer.bit();
    }

    pub fn remove(&mut self, layer: Layer) {
        self.0 &= !layer.bit();
    }

    #[inline]
    pub fn contains(self, layer: Layer) -> bool {
        self.0 & layer.bit() != 0
    }

    #[inline]
    pub fn intersection(self, other: LayerSet) -> LayerSet {
        LayerSet(self.0 & other.0)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Layer> {
        Layer::ALL.into_iter().filter(move |l| self.contains(*l))
    }
}

impl fmt::Display for LayerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Layer::as_str).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Metadata carried with every payload on every layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeHeader {
    pub publisher_id: EntityId,
    pub topic_name: String,
    /// Send time in microseconds since the Unix epoch
    pub send_time_us: i64,
    pub send_clock: u64,
}

/// Header plus owned payload, as carried by the UDP and TCP layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub payload: Vec<u8>,
}

const ENVELOPE_MAGIC: u32 = 0x4D42_4531; // "MBE1"
const ENVELOPE_VERSION: u16 = 1;

impl Envelope {
    /// Serialize header and payload in one buffer.
    pub fn encode(header: &EnvelopeHeader, payload: &[u8]) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(64 + header.topic_name.len() + payload.len());
        w.put_u32(ENVELOPE_MAGIC)
            .put_u16(ENVELOPE_VERSION)
            .put_str(&header.topic_name)
            .put_u64(header.publisher_id.entity_id)
            .put_i32(header.publisher_id.process_id)
            .put_str(&header.publisher_id.host_name)
            .put_i64(header.send_time_us)
            .put_u64(header.send_clock)
            .put_blob(payload);
        w.into_inner()
    }

    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let mut r = WireReader::new(buf);
        r.expect_magic(ENVELOPE_MAGIC)?;
        let version = r.get_u16()?;
        if version > ENVELOPE_VERSION {
            return Err(crate::wire::WireError::UnsupportedVersion(version));
        }
        let topic_name = r.get_string()?;
        let entity_id = r.get_u64()?;
        let process_id = r.get_i32()?;
        let host_name = r.get_string()?;
        let send_time_us = r.get_i64()?;
        let send_clock = r.get_u64()?;
        let payload = r.get_blob()?.to_vec();
        Ok(Self {
            header: EnvelopeHeader {
                publisher_id: EntityId::new(entity_id, process_id, host_name),
                topic_name,
                send_time_us,
                send_clock,
            },
            payload,
        })
    }
}

/// Receive-side contract: layers push arriving samples here.
///
/// Called concurrently from every layer's background thread.
pub trait SampleSink: Send + Sync {
    fn apply_sample(&self, layer: Layer, header: &EnvelopeHeader, payload: &[u8]);
}

/// Per-send parameters handed to every writer.
#[derive(Debug, Clone, Copy)]
pub struct WriteContext<'a> {
    pub publisher_id: &'a EntityId,
    pub topic_name: &'a str,
    pub send_time_us: i64,
    pub send_clock: u64,
}

impl WriteContext<'_> {
    pub fn header(&self) -> EnvelopeHeader {
        EnvelopeHeader {
            publisher_id: self.publisher_id.clone(),
            topic_name: self.topic_name.to_string(),
            send_time_us: self.send_time_us,
            send_clock: self.send_clock,
        }
    }
}

/// Send-side contract shared by all layers.
pub trait LayerWriter: Send + Sync {
    fn layer(&self) -> Layer;

    /// Best-effort delivery to every connected reader of this layer.
    /// Returns `false` only on a local resource failure.
    fn write(&self, ctx: &WriteContext<'_>, payload: &[u8]) -> bool;

    /// A matched subscriber announced itself (called on every refresh).
    fn connect(&self, subscriber: &RegistrationSample);

    /// A matched subscriber went away.
    fn disconnect(&self, subscriber_id: &EntityId);

    /// Whether a write would currently reach anyone.
    fn has_readers(&self) -> bool;

    /// Fill in this layer's parameters of the publisher registration.
    fn describe(&self, sample: &mut RegistrationSample);

    /// Release sockets, threads and segments.
    fn shutdown(&self) {}
}
