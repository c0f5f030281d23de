// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher: one topic, one send clock, fanned out to every matched layer.

use super::events::PublisherEvent;
use super::payload::{to_vec, BufferPayload, PayloadWriter};
use crate::callback::{guarded, EventCallback};
use crate::config::{PublisherConfig, DEFAULT_TIME_ARGUMENT};
use crate::context::{Context, LocalEntity, Runtime};
use crate::entity::{DataTypeInformation, EntityId, TopicId};
use crate::error::{validate_name, Result};
use crate::process;
use crate::registration::{EntityKind, RegistrationSample};
use crate::transport::shm::{ShmWriter, ShmWriterOptions};
use crate::transport::tcp::TcpWriter;
use crate::transport::udp::UdpWriter;
use crate::transport::{Layer, LayerSet, LayerWriter, WriteContext};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Matched subscriber as last seen in its registration.
struct SubscriberPeer {
    topic_id: TopicId,
    layers: LayerSet,
    drop_count: u64,
}

pub(crate) struct PublisherInner {
    runtime: Arc<Runtime>,
    topic_id: TopicId,
    data_type: DataTypeInformation,
    layers: LayerSet,
    clock: AtomicU64,
    shm: Option<ShmWriter>,
    udp: Option<UdpWriter>,
    tcp: Option<TcpWriter>,
    subscribers: Mutex<HashMap<u64, SubscriberPeer>>,
    event_callback: RwLock<Option<Arc<dyn EventCallback<PublisherEvent>>>>,
}

/// Sends samples on one topic.
///
/// # Example
///
/// ```no_run
/// use meshbus::config::{Config, PublisherConfig};
/// use meshbus::context::Context;
/// use meshbus::entity::DataTypeInformation;
/// use meshbus::pubsub::Publisher;
///
/// let ctx = Context::new("talker", Config::default()).expect("config");
/// ctx.initialize().expect("init");
/// let publisher = Publisher::new(
///     &ctx,
///     "chatter",
///     DataTypeInformation::new("string", "utf-8"),
///     PublisherConfig::default(),
/// )
/// .expect("publisher");
/// publisher.send(b"hello", -1);
/// ```
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(
        ctx: &Context,
        topic_name: &str,
        data_type: DataTypeInformation,
        config: PublisherConfig,
    ) -> Result<Self> {
        validate_name(topic_name)?;
        let runtime = ctx.runtime()?;
        let topic_name = config.effective_topic_name(topic_name).to_string();
        validate_name(&topic_name)?;
        let id = EntityId::generate();

        let mut layers = LayerSet::empty();
        let shm = if config.shm_enable {
            let shm_cfg = &runtime.config().transport_layer.shm;
            let options = ShmWriterOptions {
                buffer_count: config.shm_memfile_buffer_count,
                zero_copy: config.shm_zero_copy_mode,
                acknowledge_timeout: Duration::from_millis(config.shm_acknowledge_timeout_ms),
                min_size: shm_cfg.memfile_min_size_bytes,
                reserve_percent: shm_cfg.memfile_reserve_percent,
            };
            match ShmWriter::new(&id, options) {
                Ok(writer) => {
                    layers.insert(Layer::Shm);
                    Some(writer)
                }
                Err(e) => {
                    log::warn!("[PUB] '{}': SHM layer unavailable: {}", topic_name, e);
                    None
                }
            }
        } else {
            None
        };

        let udp = match (config.udp_enable, runtime.udp_sender()) {
            (true, Some(sender)) => {
                layers.insert(Layer::Udp);
                Some(UdpWriter::new(
                    sender,
                    &runtime.config().transport_layer.udp,
                    &topic_name,
                ))
            }
            (true, None) => {
                log::warn!("[PUB] '{}': UDP layer unavailable", topic_name);
                None
            }
            _ => None,
        };

        let tcp = if config.tcp_enable {
            match TcpWriter::new(&id) {
                Ok(writer) => {
                    layers.insert(Layer::Tcp);
                    Some(writer)
                }
                Err(e) => {
                    log::warn!("[PUB] '{}': TCP layer unavailable: {}", topic_name, e);
                    None
                }
            }
        } else {
            None
        };

        let inner = Arc::new(PublisherInner {
            runtime: Arc::clone(&runtime),
            topic_id: TopicId::new(id, topic_name),
            data_type,
            layers,
            clock: AtomicU64::new(0),
            shm,
            udp,
            tcp,
            subscribers: Mutex::new(HashMap::new()),
            event_callback: RwLock::new(None),
        });
        log::debug!(
            "[PUB] created '{}' id={} layers={}",
            inner.topic_id.topic_name,
            inner.topic_id.topic_id,
            layers
        );
        runtime.register(Arc::clone(&inner) as Arc<dyn LocalEntity>);
        Ok(Self { inner })
    }

    /// Publisher using the context's default publisher configuration.
    pub fn with_defaults(
        ctx: &Context,
        topic_name: &str,
        data_type: DataTypeInformation,
    ) -> Result<Self> {
        let config = ctx.config().snapshot().publisher.clone();
        Self::new(ctx, topic_name, data_type, config)
    }

    /// Send a byte buffer. `time == -1` stamps the current time.
    pub fn send(&self, payload: &[u8], time: i64) -> bool {
        self.send_with(&mut BufferPayload::new(payload), time)
    }

    /// Send through a payload writer.
    ///
    /// The clock advances on every call, even with no subscriber, in
    /// which case nothing is serialized and the send succeeds. Returns
    /// `false` when every attempted layer failed or the context was
    /// finalized.
    pub fn send_with(&self, payload: &mut dyn PayloadWriter, time: i64) -> bool {
        self.inner.send_with(payload, time)
    }

    /// Matched subscribers right now.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    pub fn topic_id(&self) -> &TopicId {
        &self.inner.topic_id
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.topic_id.topic_name
    }

    pub fn data_type_information(&self) -> &DataTypeInformation {
        &self.inner.data_type
    }

    /// Layers this publisher actually writes on.
    pub fn layers(&self) -> LayerSet {
        self.inner.layers
    }

    /// Clock of the last send, 0 before the first one.
    pub fn send_clock(&self) -> u64 {
        self.inner.clock.load(Ordering::Acquire)
    }

    /// Install the event callback, replacing any previous one.
    pub fn set_event_callback<C>(&self, callback: C) -> bool
    where
        C: EventCallback<PublisherEvent>,
    {
        if self.inner.runtime.is_stopped() {
            return false;
        }
        *self.inner.event_callback.write() = Some(Arc::new(callback));
        true
    }

    pub fn remove_event_callback(&self) -> bool {
        self.inner.event_callback.write().take();
        true
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.inner.runtime.unregister(self.inner.as_ref());
        self.inner.close();
        log::debug!("[PUB] dropped '{}'", self.inner.topic_id.topic_name);
    }
}

impl PublisherInner {
    fn net_writers(&self) -> impl Iterator<Item = &dyn LayerWriter> {
        let udp = self.udp.as_ref().map(|w| w as &dyn LayerWriter);
        let tcp = self.tcp.as_ref().map(|w| w as &dyn LayerWriter);
        udp.into_iter().chain(tcp)
    }

    fn writers(&self) -> impl Iterator<Item = &dyn LayerWriter> {
        let shm = self.shm.as_ref().map(|w| w as &dyn LayerWriter);
        shm.into_iter().chain(self.net_writers())
    }

    fn send_with(&self, payload: &mut dyn PayloadWriter, time: i64) -> bool {
        if self.runtime.is_stopped() {
            return false;
        }
        let clock = self.clock.fetch_add(1, Ordering::AcqRel) + 1;
        let send_time_us = if time == DEFAULT_TIME_ARGUMENT {
            process::now_us()
        } else {
            time
        };

        let shm = self.shm.as_ref().filter(|w| w.has_readers());
        let net: Vec<&dyn LayerWriter> = self.net_writers().filter(|w| w.has_readers()).collect();
        if shm.is_none() && net.is_empty() {
            return true;
        }

        let ctx = WriteContext {
            publisher_id: &self.topic_id.topic_id,
            topic_name: &self.topic_id.topic_name,
            send_time_us,
            send_clock: clock,
        };

        // zero-copy only while SHM is the sole active layer, so the payload
        // writer runs exactly once per send
        let zero_copy = net.is_empty() && shm.is_some_and(ShmWriter::is_zero_copy);
        let bytes = if !zero_copy {
            match to_vec(payload) {
                Some(bytes) => Some(bytes),
                None => {
                    log::warn!(
                        "[PUB] '{}': payload writer failed for clock {}",
                        self.topic_id.topic_name,
                        clock
                    );
                    return false;
                }
            }
        } else {
            None
        };

        let mut delivered = 0usize;
        for writer in &net {
            if writer.write(&ctx, bytes.as_deref().unwrap_or_default()) {
                delivered += 1;
            }
        }
        if let Some(writer) = shm {
            let ok = match &bytes {
                Some(bytes) => writer.write(&ctx, bytes),
                None => writer.write_with(&ctx, payload),
            };
            if ok {
                delivered += 1;
            } else {
                log::warn!(
                    "[PUB] '{}': SHM write of clock {} failed",
                    self.topic_id.topic_name,
                    clock
                );
            }
        }
        delivered > 0
    }

    fn emit(&self, event: PublisherEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            guarded("PUB", || callback.on_event(&event));
        }
    }

    fn close(&self) {
        for writer in self.writers() {
            writer.shutdown();
        }
        self.subscribers.lock().clear();
    }
}

impl LocalEntity for PublisherInner {
    fn entity_id(&self) -> u64 {
        self.topic_id.topic_id.entity_id
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Publisher
    }

    fn name(&self) -> &str {
        &self.topic_id.topic_name
    }

    fn registration(&self) -> RegistrationSample {
        let mut sample = RegistrationSample::new(
            EntityKind::Publisher,
            self.topic_id.topic_id.clone(),
            self.topic_id.topic_name.clone(),
        );
        sample.unit_name = self.runtime.unit_name().to_string();
        sample.data_type = self.data_type.clone();
        sample.layers = self.layers;
        for writer in self.writers() {
            writer.describe(&mut sample);
        }
        sample.connections = self.subscribers.lock().len() as u32;
        sample
    }

    fn on_peer_registered(&self, peer: &RegistrationSample) {
        let common = self.layers.intersection(peer.layers);
        if common.is_empty() {
            return;
        }
        for writer in self.writers().filter(|w| common.contains(w.layer())) {
            writer.connect(peer);
        }

        let event = {
            let mut subscribers = self.subscribers.lock();
            match subscribers.get_mut(&peer.entity.entity_id) {
                None => {
                    subscribers.insert(
                        peer.entity.entity_id,
                        SubscriberPeer {
                            topic_id: peer.topic_id(),
                            layers: common,
                            drop_count: peer.drop_count,
                        },
                    );
                    Some(PublisherEvent::Connected {
                        subscriber: peer.topic_id(),
                        data_type: peer.data_type.clone(),
                    })
                }
                Some(known) => {
                    known.layers = common;
                    let rise = peer.drop_count.saturating_sub(known.drop_count);
                    known.drop_count = known.drop_count.max(peer.drop_count);
                    (rise > 0).then(|| PublisherEvent::Dropped {
                        subscriber: known.topic_id.clone(),
                        count: rise,
                    })
                }
            }
        };

        if let Some(event) = event {
            if let PublisherEvent::Connected { subscriber, .. } = &event {
                log::debug!(
                    "[PUB] '{}' connected to subscriber {} via {}",
                    self.topic_id.topic_name,
                    subscriber.topic_id,
                    common
                );
            }
            self.emit(event);
        }
    }

    fn on_peer_removed(&self, peer: &RegistrationSample) {
        let removed = self.subscribers.lock().remove(&peer.entity.entity_id);
        let Some(removed) = removed else {
            return;
        };
        for writer in self.writers().filter(|w| removed.layers.contains(w.layer())) {
            writer.disconnect(&peer.entity);
        }
        log::debug!(
            "[PUB] '{}' disconnected from subscriber {}",
            self.topic_id.topic_name,
            peer.entity
        );
        self.emit(PublisherEvent::Disconnected {
            subscriber: removed.topic_id,
        });
    }

    fn on_refresh(&self) {
        if let Some(shm) = &self.shm {
            shm.reclaim_dead_readers();
        }
    }

    fn shutdown(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn context() -> Context {
        let mut cfg = Config::default();
        cfg.registration.udp_enable = false;
        cfg.registration.refresh_ms = 50;
        cfg.registration.timeout_ms = 1000;
        let ctx = Context::new("pub_unit", cfg).expect("Failed to create context");
        ctx.initialize().expect("Failed to initialize");
        ctx
    }

    #[test]
    fn test_send_without_subscribers_advances_clock() {
        let ctx = context();
        let publisher = Publisher::new(
            &ctx,
            "pub_lonely",
            DataTypeInformation::new("raw", "raw"),
            PublisherConfig::default(),
        )
        .expect("Failed to create publisher");
        assert_eq!(publisher.subscriber_count(), 0);
        for expected in 1..=3 {
            assert!(publisher.send(b"payload", -1));
            assert_eq!(publisher.send_clock(), expected);
        }
        assert!(publisher.send(&[], 1234));
        assert_eq!(publisher.send_clock(), 4);
        ctx.finalize();
    }

    #[test]
    fn test_topic_renaming_and_validation() {
        let ctx = context();
        let config = PublisherConfig::default()
            .with_option("topic_renaming", "raw_imu:imu")
            .expect("Failed to set renaming")
            .with_option("layer.tcp.enable", "false")
            .expect("Failed to disable tcp");
        let publisher = Publisher::new(&ctx, "raw_imu", DataTypeInformation::default(), config)
            .expect("Failed to create publisher");
        assert_eq!(publisher.topic_name(), "imu");
        assert!(!publisher.layers().contains(Layer::Tcp));

        assert!(Publisher::new(
            &ctx,
            "",
            DataTypeInformation::default(),
            PublisherConfig::default()
        )
        .is_err());
        ctx.finalize();
    }

    #[test]
    fn test_requires_initialized_context() {
        let ctx = Context::new("pub_idle", Config::default()).expect("Failed to create context");
        let result = Publisher::new(
            &ctx,
            "pub_idle_topic",
            DataTypeInformation::default(),
            PublisherConfig::default(),
        );
        assert!(matches!(result, Err(crate::Error::NotInitialized)));
    }

    #[test]
    fn test_send_fails_after_finalize() {
        let ctx = context();
        let publisher = Publisher::with_defaults(&ctx, "pub_final", DataTypeInformation::default())
            .expect("Failed to create publisher");
        ctx.finalize();
        assert!(!publisher.send(b"late", -1));
        assert!(!publisher.set_event_callback(|_: &PublisherEvent| {}));
    }
}
