// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration directory: the eventually-consistent view of all live
//! entities, keyed by entity id.
//!
//! The directory itself is a plain data structure; the context wraps it
//! in a mutex and serializes access. Updates are last-writer-wins by
//! arrival.

use super::expmap::ExpiringMap;
use super::sample::{EntityKind, MethodRegistration, RegistrationCmd, RegistrationSample};
use crate::entity::{DataTypeInformation, ServiceId, TopicId};
use crate::transport::LayerSet;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Outcome of applying one sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    /// First sample for this entity
    New(RegistrationSample),
    /// Known entity refreshed its descriptor
    Refreshed(RegistrationSample),
    /// Entity unregistered explicitly
    Removed(RegistrationSample),
    /// Unregistration of an unknown entity
    Ignored,
}

/// One publisher or subscriber as seen through the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub kind: EntityKind,
    pub topic_id: TopicId,
    pub data_type: DataTypeInformation,
    pub layers: LayerSet,
}

/// One server or client as seen through the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service_id: ServiceId,
    pub methods: Vec<MethodRegistration>,
    pub port: u16,
}

pub struct RegistrationDirectory {
    entries: ExpiringMap<u64, RegistrationSample>,
}

impl RegistrationDirectory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: ExpiringMap::new(timeout),
        }
    }

    pub fn on_registration_sample(&mut self, sample: RegistrationSample) -> DirectoryEvent {
        self.on_registration_sample_at(sample, Instant::now())
    }

    /// Insert, refresh or remove the sample's entity. O(1) amortized.
    pub fn on_registration_sample_at(
        &mut self,
        sample: RegistrationSample,
        now: Instant,
    ) -> DirectoryEvent {
        let key = sample.entity.entity_id;
        match sample.cmd {
            RegistrationCmd::Register => {
                match self.entries.update_at(key, sample.clone(), now) {
                    None => DirectoryEvent::New(sample),
                    Some(_) => DirectoryEvent::Refreshed(sample),
                }
            }
            RegistrationCmd::Unregister => match self.entries.remove(&key) {
                Some(previous) => DirectoryEvent::Removed(previous),
                None => DirectoryEvent::Ignored,
            },
        }
    }

    pub fn expire(&mut self) -> Vec<RegistrationSample> {
        self.expire_at(Instant::now())
    }

    /// Drop entries whose refresh deadline passed. O(n).
    pub fn expire_at(&mut self, now: Instant) -> Vec<RegistrationSample> {
        let expired: Vec<RegistrationSample> = self
            .entries
            .erase_expired_at(now)
            .into_iter()
            .map(|(_, sample)| sample)
            .collect();
        for sample in &expired {
            log::debug!(
                "[REG] expired {:?} '{}' id={}",
                sample.kind,
                sample.name,
                sample.entity
            );
        }
        expired
    }

    /// Live entities of the opposite role on the same topic or service.
    pub fn match_set(&self, name: &str, role: EntityKind) -> Vec<RegistrationSample> {
        let wanted = role.opposite();
        self.entries
            .values()
            .filter(|s| s.kind == wanted && s.name == name)
            .cloned()
            .collect()
    }

    pub fn get(&self, entity_id: u64) -> Option<&RegistrationSample> {
        self.entries.get(&entity_id)
    }

    /// All known publishers and subscribers.
    pub fn topics(&self) -> Vec<TopicInfo> {
        let mut out: Vec<TopicInfo> = self
            .entries
            .values()
            .filter(|s| s.kind.is_topic())
            .map(|s| TopicInfo {
                kind: s.kind,
                topic_id: s.topic_id(),
                data_type: s.data_type.clone(),
                layers: s.layers,
            })
            .collect();
        out.sort_by(|a, b| a.topic_id.topic_id.cmp(&b.topic_id.topic_id));
        out
    }

    pub fn topic_names(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|s| s.kind.is_topic())
            .map(|s| s.name.clone())
            .collect()
    }

    /// All known service servers.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.service_infos(EntityKind::Server)
    }

    /// All known service clients.
    pub fn clients(&self) -> Vec<ServiceInfo> {
        self.service_infos(EntityKind::Client)
    }

    fn service_infos(&self, kind: EntityKind) -> Vec<ServiceInfo> {
        let mut out: Vec<ServiceInfo> = self
            .entries
            .values()
            .filter(|s| s.kind == kind)
            .map(|s| ServiceInfo {
                service_id: s.service_id(),
                methods: s.methods.clone(),
                port: s.service_port,
            })
            .collect();
        out.sort_by(|a, b| a.service_id.service_id.cmp(&b.service_id.service_id));
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
