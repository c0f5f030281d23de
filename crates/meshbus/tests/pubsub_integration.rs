// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher/subscriber integration tests over the real layers.

use meshbus::callback::ReceiveData;
use meshbus::config::{Config, PublisherConfig, SubscriberConfig};
use meshbus::pubsub::{PayloadWriter, PublisherEvent, SubscriberEvent};
use meshbus::{Context, DataTypeInformation, Publisher, Subscriber, TopicId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn context(unit: &str) -> Context {
    let mut cfg = Config::default();
    cfg.registration.udp_enable = false;
    cfg.registration.refresh_ms = 50;
    cfg.registration.timeout_ms = 2_000;
    let ctx = Context::new(unit, cfg).expect("Failed to create context");
    ctx.initialize().expect("Failed to initialize");
    ctx
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn dti() -> DataTypeInformation {
    DataTypeInformation::new("blob", "raw")
}

fn shm_only_publisher() -> PublisherConfig {
    PublisherConfig {
        udp_enable: false,
        tcp_enable: false,
        ..PublisherConfig::default()
    }
}

fn shm_only_subscriber() -> SubscriberConfig {
    SubscriberConfig {
        udp_enable: false,
        tcp_enable: false,
        ..SubscriberConfig::default()
    }
}

fn collect_clocks(sub: &Subscriber) -> Arc<Mutex<Vec<u64>>> {
    let clocks = Arc::new(Mutex::new(Vec::new()));
    let clocks_clone = Arc::clone(&clocks);
    sub.set_receive_callback(
        move |_: &TopicId, _: &DataTypeInformation, d: &ReceiveData<'_>| {
            clocks_clone.lock().push(d.send_clock);
        },
    );
    clocks
}

#[test]
fn test_all_layers_deliver_each_send_once() {
    let ctx = context("it_multi_layer");
    let pub_cfg = PublisherConfig {
        tcp_enable: true,
        ..PublisherConfig::default()
    };
    let sub_cfg = SubscriberConfig {
        tcp_enable: true,
        ..SubscriberConfig::default()
    };
    let sub = Subscriber::new(&ctx, "it_multi", dti(), sub_cfg).expect("Failed to create subscriber");
    let clocks = collect_clocks(&sub);
    let publisher = Publisher::new(&ctx, "it_multi", dti(), pub_cfg).expect("Failed to create publisher");

    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));
    // let the TCP session attach
    thread::sleep(Duration::from_millis(300));

    for i in 0..10u8 {
        assert!(publisher.send(&[i; 100], -1));
        thread::sleep(Duration::from_millis(5));
    }
    assert!(wait_until(Duration::from_secs(3), || clocks.lock().len() >= 10));
    // late copies from slower layers must not show up
    thread::sleep(Duration::from_millis(300));

    let mut got = clocks.lock().clone();
    assert_eq!(got.len(), 10, "received {:?}", got);
    got.sort_unstable();
    assert_eq!(got, (1..=10).collect::<Vec<u64>>());
    ctx.finalize();
}

#[test]
fn test_clocks_strictly_increase_over_multi_buffer_shm() {
    let ctx = context("it_order");
    let pub_cfg = PublisherConfig {
        shm_memfile_buffer_count: 4,
        ..shm_only_publisher()
    };
    let sub = Subscriber::new(&ctx, "it_order", dti(), shm_only_subscriber())
        .expect("Failed to create subscriber");
    let clocks = collect_clocks(&sub);
    let missed = Arc::new(AtomicUsize::new(0));
    let missed_clone = Arc::clone(&missed);
    sub.set_event_callback(move |e: &SubscriberEvent| {
        if let SubscriberEvent::Dropped { missed, .. } = e {
            missed_clone.fetch_add(*missed as usize, Ordering::SeqCst);
        }
    });
    let publisher = Publisher::new(&ctx, "it_order", dti(), pub_cfg).expect("Failed to create publisher");
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));

    const SENDS: u64 = 2_000;
    for i in 0..SENDS {
        assert!(publisher.send(&i.to_le_bytes(), -1));
    }
    assert!(wait_until(Duration::from_secs(3), || {
        clocks.lock().last().copied() == Some(SENDS)
    }));
    thread::sleep(Duration::from_millis(100));

    let got = clocks.lock().clone();
    assert!(
        got.windows(2).all(|w| w[0] < w[1]),
        "clocks not strictly increasing: {:?}",
        got
    );
    // every clock between the first and last delivered one is either
    // delivered or counted missing, never both
    let span = (got[got.len() - 1] - got[0] + 1) as usize;
    assert_eq!(got.len() + missed.load(Ordering::SeqCst), span);
    assert_eq!(sub.drop_count() as usize, missed.load(Ordering::SeqCst));
    ctx.finalize();
}

struct CountingPayload {
    value: [u8; 8],
    writes: usize,
}

impl PayloadWriter for CountingPayload {
    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        self.writes += 1;
        buf.copy_from_slice(&self.value);
        true
    }

    fn size(&self) -> usize {
        self.value.len()
    }
}

#[test]
fn test_zero_copy_with_network_layer_writes_payload_once() {
    let ctx = context("it_zero_copy");
    let pub_cfg = PublisherConfig {
        shm_zero_copy_mode: true,
        tcp_enable: false,
        ..PublisherConfig::default()
    };
    let sub = Subscriber::with_defaults(&ctx, "it_zc", dti()).expect("Failed to create subscriber");
    let payloads = Arc::new(Mutex::new(Vec::new()));
    let payloads_clone = Arc::clone(&payloads);
    sub.set_receive_callback(
        move |_: &TopicId, _: &DataTypeInformation, d: &ReceiveData<'_>| {
            payloads_clone.lock().push(d.buffer.to_vec());
        },
    );
    let publisher = Publisher::new(&ctx, "it_zc", dti(), pub_cfg).expect("Failed to create publisher");
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));
    thread::sleep(Duration::from_millis(100));

    let mut payload = CountingPayload {
        value: *b"zerocopy",
        writes: 0,
    };
    assert!(publisher.send_with(&mut payload, -1));
    assert_eq!(payload.writes, 1);
    assert!(wait_until(Duration::from_secs(3), || !payloads.lock().is_empty()));
    assert_eq!(payloads.lock()[0], b"zerocopy".to_vec());
    ctx.finalize();
}

#[test]
fn test_zero_length_payload_is_delivered() {
    let ctx = context("it_zero_len");
    let sub = Subscriber::new(&ctx, "it_empty", dti(), shm_only_subscriber())
        .expect("Failed to create subscriber");
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let sizes_clone = Arc::clone(&sizes);
    sub.set_receive_callback(
        move |_: &TopicId, _: &DataTypeInformation, d: &ReceiveData<'_>| {
            sizes_clone.lock().push(d.buffer.len());
        },
    );
    let publisher = Publisher::new(&ctx, "it_empty", dti(), shm_only_publisher())
        .expect("Failed to create publisher");
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));

    assert!(publisher.send(&[], -1));
    assert!(wait_until(Duration::from_secs(3), || !sizes.lock().is_empty()));
    assert_eq!(sizes.lock()[0], 0);
    ctx.finalize();
}

#[test]
fn test_clock_advances_without_subscribers() {
    let ctx = context("it_clock");
    let publisher = Publisher::with_defaults(&ctx, "it_lonely", dti())
        .expect("Failed to create publisher");
    assert_eq!(publisher.subscriber_count(), 0);
    for expected in 1..=5u64 {
        assert!(publisher.send(b"nobody listens", -1));
        assert_eq!(publisher.send_clock(), expected);
    }

    // a late subscriber sees the next clock, not 1
    let sub = Subscriber::new(&ctx, "it_lonely", dti(), shm_only_subscriber())
        .expect("Failed to create subscriber");
    let clocks = collect_clocks(&sub);
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));
    assert!(publisher.send(b"now", -1));
    assert!(wait_until(Duration::from_secs(3), || !clocks.lock().is_empty()));
    assert_eq!(clocks.lock()[0], 6);
    ctx.finalize();
}

#[test]
fn test_acknowledge_timeout_bounds_send() {
    let ctx = context("it_ack");
    let pub_cfg = PublisherConfig {
        shm_acknowledge_timeout_ms: 500,
        ..shm_only_publisher()
    };
    let sub = Subscriber::new(&ctx, "it_ack", dti(), shm_only_subscriber())
        .expect("Failed to create subscriber");
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    sub.set_receive_callback(
        move |_: &TopicId, _: &DataTypeInformation, _: &ReceiveData<'_>| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(600));
        },
    );
    let publisher = Publisher::new(&ctx, "it_ack", dti(), pub_cfg).expect("Failed to create publisher");
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));

    let start = Instant::now();
    assert!(publisher.send(b"slow reader", -1));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(400), "returned after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1_500), "returned after {:?}", elapsed);
    assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1));
    ctx.finalize();
}

#[test]
fn test_connect_and_disconnect_events() {
    let ctx = context("it_events");
    let sub = Subscriber::new(&ctx, "it_events", dti(), shm_only_subscriber())
        .expect("Failed to create subscriber");
    let sub_events = Arc::new(Mutex::new(Vec::new()));
    let sub_events_clone = Arc::clone(&sub_events);
    sub.set_event_callback(move |e: &SubscriberEvent| sub_events_clone.lock().push(e.clone()));

    let publisher = Publisher::new(&ctx, "it_events", dti(), shm_only_publisher())
        .expect("Failed to create publisher");
    let pub_events = Arc::new(Mutex::new(Vec::new()));
    let pub_events_clone = Arc::clone(&pub_events);
    publisher.set_event_callback(move |e: &PublisherEvent| pub_events_clone.lock().push(e.clone()));
    assert!(wait_until(Duration::from_secs(3), || sub.publisher_count() == 1));
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));

    drop(publisher);
    assert!(wait_until(Duration::from_secs(3), || sub.publisher_count() == 0));
    let events = sub_events.lock();
    assert!(matches!(events.first(), Some(SubscriberEvent::Connected { .. })));
    assert!(matches!(events.last(), Some(SubscriberEvent::Disconnected { .. })));
    drop(events);
    ctx.finalize();
}

#[test]
fn test_expired_publisher_is_dropped_from_directory() {
    let ctx = context("it_expiry");
    let publisher = Publisher::new(&ctx, "it_expiry", dti(), shm_only_publisher())
        .expect("Failed to create publisher");
    assert!(wait_until(Duration::from_secs(3), || ctx.topic_names().contains("it_expiry")));
    drop(publisher);
    assert!(wait_until(Duration::from_secs(3), || !ctx.topic_names().contains("it_expiry")));
    ctx.finalize();
}

#[test]
fn test_callback_removed_from_another_callback() {
    let ctx = context("it_cb_cross");
    let a = Arc::new(
        Subscriber::new(&ctx, "it_cross_a", dti(), shm_only_subscriber())
            .expect("Failed to create subscriber"),
    );
    let b = Arc::new(
        Subscriber::new(&ctx, "it_cross_b", dti(), shm_only_subscriber())
            .expect("Failed to create subscriber"),
    );
    let b_clone = Arc::clone(&b);
    let removed = Arc::new(AtomicUsize::new(0));
    let removed_clone = Arc::clone(&removed);
    a.set_receive_callback(
        move |_: &TopicId, _: &DataTypeInformation, _: &ReceiveData<'_>| {
            assert!(b_clone.remove_receive_callback());
            assert!(b_clone.set_receive_callback(
                |_: &TopicId, _: &DataTypeInformation, _: &ReceiveData<'_>| {}
            ));
            removed_clone.fetch_add(1, Ordering::SeqCst);
        },
    );
    b.set_receive_callback(|_: &TopicId, _: &DataTypeInformation, _: &ReceiveData<'_>| {});

    let publisher = Publisher::new(&ctx, "it_cross_a", dti(), shm_only_publisher())
        .expect("Failed to create publisher");
    assert!(wait_until(Duration::from_secs(3), || publisher.subscriber_count() == 1));
    assert!(publisher.send(b"x", -1));
    assert!(wait_until(Duration::from_secs(3), || removed.load(Ordering::SeqCst) == 1));
    assert!(a.remove_receive_callback());
    ctx.finalize();
}
