// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background machinery of an initialized context.
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                           Runtime                             |
//! |                                                               |
//! |  meshbus-registration  tick: refresh -> loopback + broadcast  |
//! |                        expire -> Removed edges                |
//! |  meshbus-reg-recv      remote samples -> directory            |
//! |  meshbus-udp-recv      data envelopes -> subscribers          |
//! |                                                               |
//! |  directory (Mutex)     gateway (weak local entities)          |
//! +---------------------------------------------------------------+
//! ```
//!
//! Background threads hold only a `Weak<Runtime>`. The directory lock is
//! never held while an entity callback runs.

use super::gateway::{Gateway, LocalEntity};
use crate::config::{Config, UdpMode};
use crate::entity::EntityId;
use crate::error::Result;
use crate::registration::{
    registration_destination, RegistrationDirectory, RegistrationProvider, RegistrationReceiver,
    RegistrationSample, ServiceInfo, TopicInfo,
};
use crate::transport::udp::{self, UdpReceiver, UdpSender};
use crate::transport::Envelope;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub(crate) struct Runtime {
    unit_name: String,
    config: Arc<Config>,
    directory: Mutex<RegistrationDirectory>,
    gateway: Gateway,
    registration_out: Option<(UdpSender, SocketAddr)>,
    data_sender: Option<Arc<UdpSender>>,
    data_receiver: Mutex<Option<UdpReceiver>>,
    registration_in: Mutex<Option<RegistrationReceiver>>,
    provider: Mutex<Option<RegistrationProvider>>,
    stopped: AtomicBool,
}

impl Runtime {
    /// Open the sockets and start the background threads.
    ///
    /// Socket failures disable the affected channel with a warning; only
    /// a failure to spawn the registration timer is an error.
    pub(crate) fn start(unit_name: &str, config: Arc<Config>) -> Result<Arc<Self>> {
        let udp_cfg = &config.transport_layer.udp;
        let sender_id = EntityId::generate().entity_id;

        let registration_out = if config.registration.udp_enable {
            match udp::open_sender(udp_cfg) {
                Ok(socket) => Some((
                    UdpSender::new(socket, sender_id),
                    registration_destination(&config.registration, udp_cfg),
                )),
                Err(e) => {
                    log::warn!("[REG] registration sender unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let data_sender = match udp::open_sender(udp_cfg) {
            Ok(socket) => Some(Arc::new(UdpSender::new(socket, sender_id.wrapping_add(1)))),
            Err(e) => {
                log::warn!("[UDP] data sender unavailable, UDP layer disabled: {}", e);
                None
            }
        };

        let runtime = Arc::new(Self {
            unit_name: unit_name.to_string(),
            config: Arc::clone(&config),
            directory: Mutex::new(RegistrationDirectory::new(Duration::from_millis(
                config.registration.timeout_ms,
            ))),
            gateway: Gateway::new(),
            registration_out,
            data_sender,
            data_receiver: Mutex::new(None),
            registration_in: Mutex::new(None),
            provider: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        runtime.start_receivers();

        let weak = Arc::downgrade(&runtime);
        let provider = RegistrationProvider::start(
            Duration::from_millis(config.registration.refresh_ms),
            move || {
                if let Some(rt) = weak.upgrade() {
                    rt.tick();
                }
            },
        )?;
        *runtime.provider.lock() = Some(provider);

        log::debug!(
            "[CONTEXT] runtime for '{}' started (refresh {} ms, timeout {} ms)",
            unit_name,
            config.registration.refresh_ms,
            config.registration.timeout_ms
        );
        Ok(runtime)
    }

    fn start_receivers(self: &Arc<Self>) {
        let udp_cfg = &self.config.transport_layer.udp;

        if self.config.registration.udp_enable {
            let weak = Arc::downgrade(self);
            let handler = Arc::new(move |sample: RegistrationSample| {
                if let Some(rt) = weak.upgrade() {
                    rt.apply_sample(sample);
                }
            });
            match RegistrationReceiver::start(&self.config.registration, udp_cfg, handler) {
                Ok(receiver) => *self.registration_in.lock() = Some(receiver),
                Err(e) => log::warn!("[REG] registration receiver unavailable: {}", e),
            }
        }

        if self.data_sender.is_some() {
            let weak: Weak<Self> = Arc::downgrade(self);
            let started = udp::bind_receiver(udp_cfg.port, udp_cfg.receive_buffer).and_then(
                |socket| {
                    UdpReceiver::start(
                        "meshbus-udp-recv",
                        socket,
                        Arc::new(move |message: &[u8]| {
                            let Some(rt) = weak.upgrade() else {
                                return;
                            };
                            match Envelope::decode(message) {
                                Ok(env) => rt.gateway.dispatch_udp(&env.header, &env.payload),
                                Err(e) => log::debug!("[UDP] dropping malformed envelope: {}", e),
                            }
                        }),
                    )
                },
            );
            match started {
                Ok(receiver) => *self.data_receiver.lock() = Some(receiver),
                Err(e) => log::warn!(
                    "[UDP] data receiver on port {} unavailable: {}",
                    udp_cfg.port,
                    e
                ),
            }
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn udp_sender(&self) -> Option<Arc<UdpSender>> {
        self.data_sender.clone()
    }

    /// Make the shared UDP socket receive `topic_name` in network mode.
    pub(crate) fn join_topic_group(&self, topic_name: &str) {
        let udp_cfg = &self.config.transport_layer.udp;
        if udp_cfg.mode != UdpMode::Network {
            return;
        }
        let group = udp::topic_group(udp_cfg, topic_name);
        if let Some(receiver) = self.data_receiver.lock().as_ref() {
            if let Err(e) = receiver.join_group(group) {
                log::warn!("[UDP] join of {} for '{}' failed: {}", group, topic_name, e);
            }
        }
    }

    /// Announce a new local entity and hand it the peers already known.
    pub(crate) fn register(&self, entity: Arc<dyn LocalEntity>) {
        if self.is_stopped() {
            return;
        }
        self.gateway.insert(&entity);
        self.publish_sample(&entity.registration());

        let peers = self
            .directory
            .lock()
            .match_set(entity.name(), entity.kind());
        for peer in peers
            .iter()
            .filter(|p| p.entity.entity_id != entity.entity_id())
        {
            entity.on_peer_registered(peer);
        }
    }

    /// Remove a local entity and announce its departure right away.
    pub(crate) fn unregister(&self, entity: &dyn LocalEntity) {
        if !self.gateway.remove(entity.entity_id()) || self.is_stopped() {
            return;
        }
        self.publish_sample(&entity.registration().to_unregister());
    }

    /// Re-announce a local entity outside the refresh cycle.
    pub(crate) fn refresh_entity(&self, entity: &dyn LocalEntity) {
        if !self.is_stopped() {
            self.publish_sample(&entity.registration());
        }
    }

    fn publish_sample(&self, sample: &RegistrationSample) {
        if self.config.registration.loopback {
            self.apply_sample(sample.clone());
        }
        self.broadcast(sample);
    }

    fn broadcast(&self, sample: &RegistrationSample) {
        if let Some((sender, dest)) = &self.registration_out {
            if let Err(e) = sender.send(&sample.encode(), *dest) {
                log::debug!(
                    "[REG] broadcast of '{}' ({}) to {} failed: {}",
                    sample.name,
                    sample.entity,
                    dest,
                    e
                );
            }
        }
    }

    pub(crate) fn apply_sample(&self, sample: RegistrationSample) {
        if self.is_stopped() {
            return;
        }
        let event = self.directory.lock().on_registration_sample(sample);
        self.gateway.dispatch(&event);
    }

    /// One registration cycle.
    fn tick(&self) {
        if self.is_stopped() {
            return;
        }
        for entity in self.gateway.all() {
            entity.on_refresh();
            self.publish_sample(&entity.registration());
        }
        let expired = self.directory.lock().expire();
        for sample in &expired {
            self.gateway.dispatch_removed(sample);
        }
    }

    pub(crate) fn topics(&self) -> Vec<TopicInfo> {
        self.directory.lock().topics()
    }

    pub(crate) fn topic_names(&self) -> BTreeSet<String> {
        self.directory.lock().topic_names()
    }

    pub(crate) fn services(&self) -> Vec<ServiceInfo> {
        self.directory.lock().services()
    }

    pub(crate) fn clients(&self) -> Vec<ServiceInfo> {
        self.directory.lock().clients()
    }

    pub(crate) fn lookup(&self, entity_id: u64) -> Option<RegistrationSample> {
        self.directory.lock().get(entity_id).cloned()
    }

    pub(crate) fn match_set(
        &self,
        name: &str,
        role: crate::registration::EntityKind,
    ) -> Vec<RegistrationSample> {
        self.directory.lock().match_set(name, role)
    }

    /// Unregister and stop every local entity, then stop the threads.
    /// Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let entities = self.gateway.drain();
        for entity in &entities {
            self.broadcast(&entity.registration().to_unregister());
            entity.shutdown();
        }
        drop(entities);

        let provider = self.provider.lock().take();
        if let Some(provider) = provider {
            provider.stop();
        }
        let registration_in = self.registration_in.lock().take();
        if let Some(receiver) = registration_in {
            receiver.stop();
        }
        let data_receiver = self.data_receiver.lock().take();
        if let Some(receiver) = data_receiver {
            receiver.stop();
        }
        self.directory.lock().clear();
        log::debug!("[CONTEXT] runtime for '{}' stopped", self.unit_name);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
