// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local entity registry of one context.
//!
//! Tracks the publishers, subscribers, servers and clients created on the
//! context so that directory events and UDP samples reach them.
//!
//! ```text
//! 1. User creates a Subscriber on "imu"
//! 2. Gateway stores a weak handle keyed by entity id
//! 3. Directory reports Publisher "imu" as New / Refreshed
//! 4. Gateway finds local Subscribers on "imu"
//! 5. Subscriber::on_peer_registered starts its layer readers
//! ```
//!
//! Handles are weak: dropping the user-facing object is what removes an
//! entity, the gateway never keeps one alive. Callbacks are invoked on a
//! snapshot taken outside the registry lock, so an entity may create or
//! drop other entities from inside them.

use crate::registration::{DirectoryEvent, EntityKind, RegistrationSample};
use crate::transport::EnvelopeHeader;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// What the context needs from every local entity.
pub(crate) trait LocalEntity: Send + Sync {
    fn entity_id(&self) -> u64;

    fn kind(&self) -> EntityKind;

    /// Topic or service name.
    fn name(&self) -> &str;

    /// Current registration descriptor.
    fn registration(&self) -> RegistrationSample;

    /// A matching peer registered or refreshed its registration.
    fn on_peer_registered(&self, peer: &RegistrationSample);

    /// A matching peer unregistered or expired.
    fn on_peer_removed(&self, peer: &RegistrationSample);

    /// A sample arrived on the context UDP socket for this entity's topic.
    fn on_udp_sample(&self, _header: &EnvelopeHeader, _payload: &[u8]) {}

    /// Periodic housekeeping, once per registration refresh.
    fn on_refresh(&self) {}

    /// The context is being finalized.
    fn shutdown(&self);
}

#[derive(Default)]
pub(crate) struct Gateway {
    entities: RwLock<HashMap<u64, Weak<dyn LocalEntity>>>,
}

impl Gateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, entity: &Arc<dyn LocalEntity>) {
        self.entities
            .write()
            .insert(entity.entity_id(), Arc::downgrade(entity));
    }

    pub(crate) fn remove(&self, entity_id: u64) -> bool {
        self.entities.write().remove(&entity_id).is_some()
    }

    /// Strong snapshot of every live entity.
    pub(crate) fn all(&self) -> Vec<Arc<dyn LocalEntity>> {
        self.entities
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Local entities of `kind` on `name`.
    pub(crate) fn find(&self, kind: EntityKind, name: &str) -> Vec<Arc<dyn LocalEntity>> {
        self.entities
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|e| e.kind() == kind && e.name() == name)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Remove every entry and return the live ones.
    pub(crate) fn drain(&self) -> Vec<Arc<dyn LocalEntity>> {
        self.entities
            .write()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }

    /// Forward a directory edge to the local entities it concerns.
    pub(crate) fn dispatch(&self, event: &DirectoryEvent) {
        match event {
            DirectoryEvent::New(sample) | DirectoryEvent::Refreshed(sample) => {
                for entity in self.peers_of(sample) {
                    entity.on_peer_registered(sample);
                }
            }
            DirectoryEvent::Removed(sample) => self.dispatch_removed(sample),
            DirectoryEvent::Ignored => {}
        }
    }

    pub(crate) fn dispatch_removed(&self, sample: &RegistrationSample) {
        for entity in self.peers_of(sample) {
            entity.on_peer_removed(sample);
        }
    }

    /// Route a sample from the shared UDP socket to the subscribers of
    /// its topic.
    pub(crate) fn dispatch_udp(&self, header: &EnvelopeHeader, payload: &[u8]) {
        for entity in self.find(EntityKind::Subscriber, &header.topic_name) {
            entity.on_udp_sample(header, payload);
        }
    }

    fn peers_of(&self, sample: &RegistrationSample) -> Vec<Arc<dyn LocalEntity>> {
        let mut peers = self.find(sample.kind.opposite(), &sample.name);
        peers.retain(|e| e.entity_id() != sample.entity.entity_id);
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityId;
    use parking_lot::Mutex;

    struct FakeEntity {
        id: u64,
        kind: EntityKind,
        name: String,
        seen: Mutex<Vec<(bool, u64)>>,
    }

    impl FakeEntity {
        fn new(id: u64, kind: EntityKind, name: &str) -> Arc<Self> {
            Arc::new(Self {
                id,
                kind,
                name: name.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl LocalEntity for FakeEntity {
        fn entity_id(&self) -> u64 {
            self.id
        }
        fn kind(&self) -> EntityKind {
            self.kind
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn registration(&self) -> RegistrationSample {
            RegistrationSample::new(self.kind, EntityId::new(self.id, 1, "h"), self.name.clone())
        }
        fn on_peer_registered(&self, peer: &RegistrationSample) {
            self.seen.lock().push((true, peer.entity.entity_id));
        }
        fn on_peer_removed(&self, peer: &RegistrationSample) {
            self.seen.lock().push((false, peer.entity.entity_id));
        }
        fn shutdown(&self) {}
    }

    #[test]
    fn test_dispatch_reaches_opposite_role_on_same_name() {
        let gateway = Gateway::new();
        let sub = FakeEntity::new(1, EntityKind::Subscriber, "imu");
        let other_topic = FakeEntity::new(2, EntityKind::Subscriber, "gps");
        let same_role = FakeEntity::new(3, EntityKind::Publisher, "imu");
        for e in [&sub, &other_topic, &same_role] {
            let e: Arc<dyn LocalEntity> = e.clone();
            gateway.insert(&e);
        }

        let publisher = RegistrationSample::new(
            EntityKind::Publisher,
            EntityId::new(9, 1, "h"),
            "imu",
        );
        gateway.dispatch(&DirectoryEvent::New(publisher.clone()));
        gateway.dispatch(&DirectoryEvent::Removed(publisher));

        assert_eq!(*sub.seen.lock(), vec![(true, 9), (false, 9)]);
        assert!(other_topic.seen.lock().is_empty());
        assert!(same_role.seen.lock().is_empty());
    }

    #[test]
    fn test_dropped_entities_are_skipped() {
        let gateway = Gateway::new();
        let sub = FakeEntity::new(1, EntityKind::Subscriber, "imu");
        let as_dyn: Arc<dyn LocalEntity> = sub.clone();
        gateway.insert(&as_dyn);
        drop(as_dyn);
        drop(sub);
        assert_eq!(gateway.len(), 1);
        assert!(gateway.all().is_empty());
        assert!(gateway.drain().is_empty());
        assert_eq!(gateway.len(), 0);
    }
}
