// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Identity model: entity, topic and service identifiers plus the
//! data type description attached to every topic.
//!
//! An [`EntityId`] is assigned once when a publisher, subscriber, server
//! or client is constructed and never changes. Equality, ordering and
//! hashing look at `entity_id` only; `process_id` and `host_name` are
//! informational.

use crate::process;
use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct EntityId {
    pub entity_id: u64,
    pub process_id: i32,
    pub host_name: String,
}

impl EntityId {
    /// Allocate a fresh id for an entity of this process.
    pub fn generate() -> Self {
        Self {
            entity_id: next_entity_id(),
            process_id: process::process_id(),
            host_name: process::host_name().to_string(),
        }
    }

    pub fn new(entity_id: u64, process_id: i32, host_name: impl Into<String>) -> Self {
        Self {
            entity_id,
            process_id,
            host_name: host_name.into(),
        }
    }

    /// Entity lives on this host.
    pub fn is_local_host(&self) -> bool {
        self.host_name == process::host_name()
    }

    /// Entity lives in this process.
    pub fn is_local_process(&self) -> bool {
        self.is_local_host() && self.process_id == process::process_id()
    }
}

impl PartialEq for EntityId {
    fn eq(&self, other: &Self) -> bool {
        self.entity_id == other.entity_id
    }
}

impl Eq for EntityId {}

impl Hash for EntityId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_id.hash(state);
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.entity_id.cmp(&other.entity_id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entity_id)
    }
}

/// Process-unique, host-practically-unique id source.
///
/// The counter is seeded from the pid and the startup time so two
/// processes on one host do not hand out overlapping ranges.
fn next_entity_id() -> u64 {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| {
        let pid = process::process_id() as u64;
        let t = process::now_us() as u64;
        let seed = (pid << 40) ^ (t.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 8);
        AtomicU64::new(seed | 1)
    });
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        // 0 is reserved for "no owner" in shared memory reader slots
        if id != 0 {
            return id;
        }
    }
}

/// Identity of one publisher or subscriber instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicId {
    pub topic_id: EntityId,
    pub topic_name: String,
}

impl TopicId {
    pub fn new(topic_id: EntityId, topic_name: impl Into<String>) -> Self {
        Self {
            topic_id,
            topic_name: topic_name.into(),
        }
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.topic_name, self.topic_id)
    }
}

/// Identity of one service server or client instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub service_id: EntityId,
    pub service_name: String,
}

impl ServiceId {
    pub fn new(service_id: EntityId, service_name: impl Into<String>) -> Self {
        Self {
            service_id,
            service_name: service_name.into(),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_name, self.service_id)
    }
}

/// Payload schema description.
///
/// `descriptor` is opaque and usually binary (a serialized schema).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DataTypeInformation {
    pub name: String,
    pub encoding: String,
    pub descriptor: Vec<u8>,
}

impl DataTypeInformation {
    pub fn new(name: impl Into<String>, encoding: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            encoding: encoding.into(),
            descriptor: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, descriptor: impl Into<Vec<u8>>) -> Self {
        self.descriptor = descriptor.into();
        self
    }

    /// Loose compatibility check used for mismatch warnings.
    ///
    /// Empty name or encoding on either side acts as a wildcard.
    pub fn is_compatible(&self, other: &DataTypeInformation) -> bool {
        let field_ok = |a: &str, b: &str| a.is_empty() || b.is_empty() || a == b;
        field_ok(&self.name, &other.name) && field_ok(&self.encoding, &other.encoding)
    }
}
