// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber: receives one topic from every matched layer and delivers
//! each logical send exactly once.
//!
//! ```text
//!  ShmObserver(s) --+
//!  TcpReader      --+--> apply_sample --> layer / peer check
//!  context UDP    --+         |
//!                             v
//!                    DedupTable (per publisher)
//!                             |
//!                 callback ---+--- polling queue
//! ```
//!
//! Deliveries of one subscriber are serialized: the callback never runs
//! concurrently with itself, and a publisher's clocks are observed in
//! increasing order unless a late copy is let through as out-of-order.

use super::dedup::{DedupTable, DedupVerdict};
use super::events::SubscriberEvent;
use crate::callback::{guarded, EventCallback, ReceiveCallback, ReceiveData};
use crate::config::{SubscriberConfig, DEFAULT_TIME_ARGUMENT, RECEIVE_QUEUE_DEPTH};
use crate::context::{Context, LocalEntity, Runtime};
use crate::entity::{DataTypeInformation, EntityId, TopicId};
use crate::error::{validate_name, Result};
use crate::registration::{EntityKind, RegistrationSample};
use crate::transport::shm::ShmObserver;
use crate::transport::tcp::TcpReader;
use crate::transport::{EnvelopeHeader, Layer, LayerSet, SampleSink};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// A sample taken with [`Subscriber::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub publisher: TopicId,
    pub payload: Vec<u8>,
    pub send_timestamp: i64,
    pub send_clock: u64,
}

struct PeerInfo {
    topic_id: TopicId,
    data_type: DataTypeInformation,
}

/// Matched publisher and the readers attached to it.
struct PublisherPeer {
    info: Arc<PeerInfo>,
    layers: LayerSet,
    observers: Vec<ShmObserver>,
    tcp: Option<TcpReader>,
}

/// Layer-facing handle that does not keep the subscriber alive.
struct WeakSink(Weak<SubscriberInner>);

impl SampleSink for WeakSink {
    fn apply_sample(&self, layer: Layer, header: &EnvelopeHeader, payload: &[u8]) {
        if let Some(inner) = self.0.upgrade() {
            inner.apply_sample(layer, header, payload);
        }
    }
}

pub(crate) struct SubscriberInner {
    runtime: Arc<Runtime>,
    self_ref: Weak<SubscriberInner>,
    topic_id: TopicId,
    data_type: DataTypeInformation,
    layers: LayerSet,
    publishers: Mutex<HashMap<u64, PublisherPeer>>,
    /// Held for the whole delivery of one sample
    delivery: Mutex<DedupTable>,
    /// Publishers whose dedup record must go at the next delivery
    evicted: Mutex<Vec<u64>>,
    drop_count: AtomicU64,
    receive_callback: RwLock<Option<Arc<dyn ReceiveCallback>>>,
    event_callback: RwLock<Option<Arc<dyn EventCallback<SubscriberEvent>>>>,
    queue: Mutex<VecDeque<ReceivedMessage>>,
    queue_cv: Condvar,
    closed: AtomicBool,
}

/// Receives samples on one topic.
///
/// # Example
///
/// ```no_run
/// use meshbus::callback::ReceiveData;
/// use meshbus::config::{Config, SubscriberConfig};
/// use meshbus::context::Context;
/// use meshbus::entity::{DataTypeInformation, TopicId};
/// use meshbus::pubsub::Subscriber;
///
/// let ctx = Context::new("listener", Config::default()).expect("config");
/// ctx.initialize().expect("init");
/// let subscriber = Subscriber::new(
///     &ctx,
///     "chatter",
///     DataTypeInformation::new("string", "utf-8"),
///     SubscriberConfig::default(),
/// )
/// .expect("subscriber");
/// subscriber.set_receive_callback(
///     |_: &TopicId, _: &DataTypeInformation, data: &ReceiveData<'_>| {
///         println!("{} bytes, clock {}", data.buffer.len(), data.send_clock);
///     },
/// );
/// ```
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn new(
        ctx: &Context,
        topic_name: &str,
        data_type: DataTypeInformation,
        config: SubscriberConfig,
    ) -> Result<Self> {
        validate_name(topic_name)?;
        let runtime = ctx.runtime()?;
        let topic_name = config.effective_topic_name(topic_name).to_string();
        validate_name(&topic_name)?;

        let mut layers = config.layers();
        if cfg!(not(target_os = "linux")) {
            layers.remove(Layer::Shm);
        }
        if layers.contains(Layer::Udp) {
            if runtime.udp_sender().is_some() {
                runtime.join_topic_group(&topic_name);
            } else {
                layers.remove(Layer::Udp);
            }
        }

        let inner = Arc::new_cyclic(|self_ref| SubscriberInner {
            runtime: Arc::clone(&runtime),
            self_ref: self_ref.clone(),
            topic_id: TopicId::new(EntityId::generate(), topic_name),
            data_type,
            layers,
            publishers: Mutex::new(HashMap::new()),
            delivery: Mutex::new(DedupTable::new(config.drop_out_of_order_messages)),
            evicted: Mutex::new(Vec::new()),
            drop_count: AtomicU64::new(0),
            receive_callback: RwLock::new(None),
            event_callback: RwLock::new(None),
            queue: Mutex::new(VecDeque::new()),
            queue_cv: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        log::debug!(
            "[SUB] created '{}' id={} layers={}",
            inner.topic_id.topic_name,
            inner.topic_id.topic_id,
            layers
        );
        runtime.register(Arc::clone(&inner) as Arc<dyn LocalEntity>);
        Ok(Self { inner })
    }

    /// Subscriber using the context's default subscriber configuration.
    pub fn with_defaults(
        ctx: &Context,
        topic_name: &str,
        data_type: DataTypeInformation,
    ) -> Result<Self> {
        let config = ctx.config().snapshot().subscriber.clone();
        Self::new(ctx, topic_name, data_type, config)
    }

    /// Install the receive callback, replacing any previous one.
    ///
    /// Safe to call from inside any callback. A delivery already in
    /// progress on another thread may still use the previous callback.
    pub fn set_receive_callback<C: ReceiveCallback>(&self, callback: C) -> bool {
        if self.inner.is_closed() {
            return false;
        }
        *self.inner.receive_callback.write() = Some(Arc::new(callback));
        true
    }

    /// Remove the receive callback. Succeeds when none is set.
    pub fn remove_receive_callback(&self) -> bool {
        self.inner.receive_callback.write().take();
        true
    }

    pub fn set_event_callback<C: EventCallback<SubscriberEvent>>(&self, callback: C) -> bool {
        if self.inner.is_closed() {
            return false;
        }
        *self.inner.event_callback.write() = Some(Arc::new(callback));
        true
    }

    pub fn remove_event_callback(&self) -> bool {
        self.inner.event_callback.write().take();
        true
    }

    /// Take the oldest queued sample, waiting up to `timeout_ms`
    /// (`-1` waits until a sample arrives or the subscriber closes).
    ///
    /// Samples are queued only while no receive callback is set; the
    /// queue keeps the newest `RECEIVE_QUEUE_DEPTH` of them.
    pub fn receive(&self, timeout_ms: i64) -> Option<ReceivedMessage> {
        let deadline = (timeout_ms != DEFAULT_TIME_ARGUMENT)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms.max(0) as u64));
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(message) = queue.pop_front() {
                return Some(message);
            }
            if self.inner.is_closed() {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.inner.queue_cv.wait_until(&mut queue, deadline).timed_out() {
                        return queue.pop_front();
                    }
                }
                None => self.inner.queue_cv.wait(&mut queue),
            }
        }
    }

    /// Matched publishers right now.
    pub fn publisher_count(&self) -> usize {
        self.inner.publishers.lock().len()
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

    pub fn layers(&self) -> LayerSet {
        self.inner.layers
    }

    /// Clocks detected missing across all publishers.
    pub fn drop_count(&self) -> u64 {
        self.inner.drop_count.load(Ordering::Acquire)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.inner.runtime.unregister(self.inner.as_ref());
        self.inner.close();
        log::debug!("[SUB] dropped '{}'", self.inner.topic_id.topic_name);
    }
}

impl SubscriberInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.runtime.is_stopped()
    }

    fn sink(&self) -> Arc<dyn SampleSink> {
        Arc::new(WeakSink(self.self_ref.clone()))
    }

    fn apply_sample(&self, layer: Layer, header: &EnvelopeHeader, payload: &[u8]) {
        if self.closed.load(Ordering::Acquire)
            || !self.layers.contains(layer)
            || header.topic_name != self.topic_id.topic_name
        {
            return;
        }
        let publisher_id = header.publisher_id.entity_id;
        let Some(info) = self
            .publishers
            .lock()
            .get(&publisher_id)
            .map(|p| Arc::clone(&p.info))
        else {
            return;
        };

        let mut dedup = self.delivery.lock();
        for evicted in self.evicted.lock().drain(..) {
            dedup.remove(evicted);
        }
        match dedup.check(publisher_id, header.send_clock) {
            DedupVerdict::Duplicate => return,
            DedupVerdict::Discard => {
                log::debug!(
                    "[SUB] '{}': discarding late clock {} from {} ({})",
                    self.topic_id.topic_name,
                    header.send_clock,
                    header.publisher_id,
                    layer
                );
                return;
            }
            DedupVerdict::DeliverOutOfOrder => {
                let _ = self
                    .drop_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
                log::warn!(
                    "[SUB] '{}': out-of-order clock {} from {} ({})",
                    self.topic_id.topic_name,
                    header.send_clock,
                    header.publisher_id,
                    layer
                );
            }
            DedupVerdict::DeliverAfterGap { missed } => {
                self.drop_count.fetch_add(missed, Ordering::AcqRel);
                log::debug!(
                    "[SUB] '{}': {} message(s) lost before clock {} from {}",
                    self.topic_id.topic_name,
                    missed,
                    header.send_clock,
                    header.publisher_id
                );
                self.emit(SubscriberEvent::Dropped {
                    publisher: info.topic_id.clone(),
                    missed,
                });
            }
            DedupVerdict::Deliver => {}
        }

        let callback = self.receive_callback.read().clone();
        match callback {
            Some(callback) => {
                let data = ReceiveData {
                    buffer: payload,
                    send_timestamp: header.send_time_us,
                    send_clock: header.send_clock,
                };
                guarded("SUB", || {
                    callback.on_receive(&info.topic_id, &info.data_type, &data)
                });
            }
            None => {
                let mut queue = self.queue.lock();
                if queue.len() >= RECEIVE_QUEUE_DEPTH {
                    queue.pop_front();
                }
                queue.push_back(ReceivedMessage {
                    publisher: info.topic_id.clone(),
                    payload: payload.to_vec(),
                    send_timestamp: header.send_time_us,
                    send_clock: header.send_clock,
                });
                self.queue_cv.notify_one();
            }
        }
        drop(dedup);
    }

    fn emit(&self, event: SubscriberEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            guarded("SUB", || callback.on_event(&event));
        }
    }

    /// Start the readers for the layers shared with `peer`.
    fn attach_readers(&self, peer: &RegistrationSample, slot: &mut PublisherPeer) {
        let own_id = self.topic_id.topic_id.entity_id;
        if slot.layers.contains(Layer::Shm)
            && slot.observers.is_empty()
            && peer.entity.is_local_host()
        {
            for memfile in &peer.shm_memfiles {
                match ShmObserver::start(
                    memfile,
                    own_id,
                    peer.entity.clone(),
                    &self.topic_id.topic_name,
                    self.sink(),
                ) {
                    Ok(observer) => slot.observers.push(observer),
                    Err(e) => log::warn!(
                        "[SUB] '{}': cannot observe {}: {}",
                        self.topic_id.topic_name,
                        memfile,
                        e
                    ),
                }
            }
        }
        if slot.layers.contains(Layer::Tcp) && slot.tcp.is_none() && peer.tcp_port != 0 {
            let max_reconnections = self.runtime.config().transport_layer.tcp.max_reconnections;
            match TcpReader::start(
                own_id,
                peer.entity.clone(),
                peer.tcp_port,
                max_reconnections,
                self.sink(),
            ) {
                Ok(reader) => slot.tcp = Some(reader),
                Err(e) => log::warn!(
                    "[SUB] '{}': cannot start TCP reader for {}: {}",
                    self.topic_id.topic_name,
                    peer.entity,
                    e
                ),
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let peers: Vec<PublisherPeer> = self.publishers.lock().drain().map(|(_, p)| p).collect();
        // joins reader threads, must run without the publishers lock
        drop(peers);
        self.receive_callback.write().take();
        self.event_callback.write().take();
        let _queue = self.queue.lock();
        self.queue_cv.notify_all();
    }
}

impl LocalEntity for SubscriberInner {
    fn entity_id(&self) -> u64 {
        self.topic_id.topic_id.entity_id
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Subscriber
    }

    fn name(&self) -> &str {
        &self.topic_id.topic_name
    }

    fn registration(&self) -> RegistrationSample {
        let mut sample = RegistrationSample::new(
            EntityKind::Subscriber,
            self.topic_id.topic_id.clone(),
            self.topic_id.topic_name.clone(),
        );
        sample.unit_name = self.runtime.unit_name().to_string();
        sample.data_type = self.data_type.clone();
        sample.layers = self.layers;
        sample.drop_count = self.drop_count.load(Ordering::Acquire);
        sample.connections = self.publishers.lock().len() as u32;
        sample
    }

    fn on_peer_registered(&self, peer: &RegistrationSample) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let common = self.layers.intersection(peer.layers);
        if common.is_empty() {
            return;
        }

        let connected = {
            let mut publishers = self.publishers.lock();
            let is_new = !publishers.contains_key(&peer.entity.entity_id);
            let slot = publishers
                .entry(peer.entity.entity_id)
                .or_insert_with(|| PublisherPeer {
                    info: Arc::new(PeerInfo {
                        topic_id: peer.topic_id(),
                        data_type: peer.data_type.clone(),
                    }),
                    layers: common,
                    observers: Vec::new(),
                    tcp: None,
                });
            slot.layers = common;
            self.attach_readers(peer, slot);
            is_new
        };

        if connected {
            if !self.data_type.is_compatible(&peer.data_type) {
                log::warn!(
                    "[SUB] '{}': publisher {} uses type '{}' ({}), expected '{}' ({})",
                    self.topic_id.topic_name,
                    peer.entity,
                    peer.data_type.name,
                    peer.data_type.encoding,
                    self.data_type.name,
                    self.data_type.encoding
                );
            }
            log::debug!(
                "[SUB] '{}' connected to publisher {} via {}",
                self.topic_id.topic_name,
                peer.entity,
                common
            );
            self.emit(SubscriberEvent::Connected {
                publisher: peer.topic_id(),
                data_type: peer.data_type.clone(),
            });
        }
    }

    fn on_peer_removed(&self, peer: &RegistrationSample) {
        let removed = self.publishers.lock().remove(&peer.entity.entity_id);
        let Some(removed) = removed else {
            return;
        };
        let publisher = removed.info.topic_id.clone();
        drop(removed);
        self.evicted.lock().push(peer.entity.entity_id);
        log::debug!(
            "[SUB] '{}' disconnected from publisher {}",
            self.topic_id.topic_name,
            peer.entity
        );
        self.emit(SubscriberEvent::Disconnected { publisher });
    }

    fn on_udp_sample(&self, header: &EnvelopeHeader, payload: &[u8]) {
        self.apply_sample(Layer::Udp, header, payload);
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
        let ctx = Context::new("sub_unit", cfg).expect("Failed to create context");
        ctx.initialize().expect("Failed to initialize");
        ctx
    }

    fn header(publisher: &EntityId, topic: &str, clock: u64) -> EnvelopeHeader {
        EnvelopeHeader {
            publisher_id: publisher.clone(),
            topic_name: topic.to_string(),
            send_time_us: 0,
            send_clock: clock,
        }
    }

    fn fake_publisher(topic: &str, layers: &[Layer]) -> RegistrationSample {
        let mut sample =
            RegistrationSample::new(EntityKind::Publisher, EntityId::generate(), topic);
        sample.layers = LayerSet::from_layers(layers);
        sample
    }

    #[test]
    fn test_rejects_unknown_publisher_and_disabled_layer() {
        let ctx = context();
        let sub = Subscriber::new(
            &ctx,
            "sub_filter",
            DataTypeInformation::default(),
            SubscriberConfig::default(),
        )
        .expect("Failed to create subscriber");
        let peer = fake_publisher("sub_filter", &[Layer::Udp]);

        // not connected yet
        sub.inner
            .apply_sample(Layer::Udp, &header(&peer.entity, "sub_filter", 1), b"x");
        assert!(sub.receive(0).is_none());

        sub.inner.on_peer_registered(&peer);
        assert_eq!(sub.publisher_count(), 1);
        // TCP is off on the subscriber side by default
        sub.inner
            .apply_sample(Layer::Tcp, &header(&peer.entity, "sub_filter", 1), b"x");
        assert!(sub.receive(0).is_none());

        sub.inner
            .apply_sample(Layer::Udp, &header(&peer.entity, "sub_filter", 1), b"x");
        let msg = sub.receive(100).expect("Failed to receive");
        assert_eq!(msg.payload, b"x");
        assert_eq!(msg.publisher.topic_id, peer.entity);
        ctx.finalize();
    }

    #[test]
    fn test_duplicates_across_layers_and_gap_event() {
        let ctx = context();
        let sub = Subscriber::new(
            &ctx,
            "sub_dedup",
            DataTypeInformation::default(),
            SubscriberConfig::default(),
        )
        .expect("Failed to create subscriber");
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = Arc::clone(&events);
        sub.set_event_callback(move |e: &SubscriberEvent| events_clone.lock().push(e.clone()));

        let peer = fake_publisher("sub_dedup", &[Layer::Shm, Layer::Udp]);
        // no memfiles advertised, so no observer is started
        sub.inner.on_peer_registered(&peer);

        let clocks = Arc::new(Mutex::new(Vec::new()));
        let clocks_clone = Arc::clone(&clocks);
        sub.set_receive_callback(
            move |_: &TopicId, _: &DataTypeInformation, d: &ReceiveData<'_>| {
                clocks_clone.lock().push(d.send_clock);
            },
        );
        for clock in [1u64, 2, 5] {
            for layer in [Layer::Shm, Layer::Udp] {
                sub.inner
                    .apply_sample(layer, &header(&peer.entity, "sub_dedup", clock), b"");
            }
        }
        assert_eq!(*clocks.lock(), vec![1, 2, 5]);
        assert_eq!(sub.drop_count(), 2);
        assert!(sub.inner.registration().drop_count == 2);

        sub.inner.on_peer_removed(&peer);
        assert_eq!(sub.publisher_count(), 0);
        let events = events.lock();
        assert!(matches!(events[0], SubscriberEvent::Connected { .. }));
        assert!(matches!(events[1], SubscriberEvent::Dropped { missed: 2, .. }));
        assert!(matches!(events[2], SubscriberEvent::Disconnected { .. }));
        drop(events);
        ctx.finalize();
    }

    fn deliver_clocks(sub: &Subscriber, peer: &RegistrationSample, clocks: &[u64]) -> Vec<u64> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        sub.set_receive_callback(
            move |_: &TopicId, _: &DataTypeInformation, d: &ReceiveData<'_>| {
                seen_clone.lock().push(d.send_clock);
            },
        );
        for &clock in clocks {
            sub.inner.apply_sample(
                Layer::Udp,
                &header(&peer.entity, sub.topic_name(), clock),
                b"",
            );
        }
        let out = seen.lock().clone();
        out
    }

    #[test]
    fn test_late_clock_discarded_by_default() {
        let ctx = context();
        let sub = Subscriber::with_defaults(&ctx, "sub_late", DataTypeInformation::default())
            .expect("Failed to create subscriber");
        let peer = fake_publisher("sub_late", &[Layer::Udp]);
        sub.inner.on_peer_registered(&peer);

        let seen = deliver_clocks(&sub, &peer, &[1, 4, 2, 3, 5]);
        assert_eq!(seen, vec![1, 4, 5]);
        assert_eq!(sub.drop_count(), 2);
        ctx.finalize();
    }

    #[test]
    fn test_late_clock_delivered_when_allowed() {
        let ctx = context();
        let cfg = SubscriberConfig {
            drop_out_of_order_messages: false,
            ..SubscriberConfig::default()
        };
        let sub = Subscriber::new(&ctx, "sub_late_ok", DataTypeInformation::default(), cfg)
            .expect("Failed to create subscriber");
        let peer = fake_publisher("sub_late_ok", &[Layer::Udp]);
        sub.inner.on_peer_registered(&peer);

        let seen = deliver_clocks(&sub, &peer, &[1, 4, 2, 3, 5]);
        assert_eq!(seen, vec![1, 4, 2, 3, 5]);
        // both gap clocks arrived late, nothing was lost
        assert_eq!(sub.drop_count(), 0);
        ctx.finalize();
    }

    #[test]
    fn test_callback_set_remove_idempotent() {
        let ctx = context();
        let sub = Subscriber::with_defaults(&ctx, "sub_cb", DataTypeInformation::default())
            .expect("Failed to create subscriber");
        assert!(sub.remove_receive_callback());
        for _ in 0..3 {
            assert!(sub.set_receive_callback(
                |_: &TopicId, _: &DataTypeInformation, _: &ReceiveData<'_>| {}
            ));
        }
        assert!(sub.remove_receive_callback());
        assert!(sub.remove_receive_callback());
        ctx.finalize();
        assert!(!sub.set_receive_callback(
            |_: &TopicId, _: &DataTypeInformation, _: &ReceiveData<'_>| {}
        ));
        assert!(sub.remove_receive_callback());
    }

    #[test]
    fn test_receive_times_out_and_wakes_on_close() {
        let ctx = context();
        let sub = Subscriber::with_defaults(&ctx, "sub_wait", DataTypeInformation::default())
            .expect("Failed to create subscriber");
        let start = Instant::now();
        assert!(sub.receive(50).is_none());
        assert!(start.elapsed() >= Duration::from_millis(45));

        let inner = Arc::clone(&sub.inner);
        let closer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            inner.close();
        });
        assert!(sub.receive(-1).is_none());
        closer.join().expect("Failed to join closer");
        ctx.finalize();
    }
}
