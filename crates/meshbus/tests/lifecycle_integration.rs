// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Context lifecycle integration tests.

use meshbus::config::Config;
use meshbus::service::{CallErrorKind, ServiceClient};
use meshbus::{
    Context, DataTypeInformation, Error, FinalizeState, InitState, Publisher, Subscriber,
};
use std::time::{Duration, Instant};

fn config() -> Config {
    let mut cfg = Config::default();
    cfg.registration.udp_enable = false;
    cfg.registration.refresh_ms = 50;
    cfg
}

#[test]
fn test_initialize_is_reference_counted() {
    let ctx = Context::new("it_refcount", config()).expect("Failed to create context");
    assert!(!ctx.is_initialized());
    assert_eq!(ctx.initialize().expect("Failed to initialize"), InitState::Initialized);
    assert_eq!(
        ctx.initialize().expect("Failed to initialize"),
        InitState::AlreadyInitialized(2)
    );

    assert_eq!(ctx.finalize(), FinalizeState::StillInitialized(1));
    assert!(ctx.is_initialized());
    assert_eq!(ctx.finalize(), FinalizeState::Finalized);
    assert!(!ctx.is_initialized());
    assert_eq!(ctx.finalize(), FinalizeState::NotInitialized);
}

#[test]
fn test_entities_need_an_initialized_context() {
    let ctx = Context::new("it_uninit", config()).expect("Failed to create context");
    let err = Publisher::with_defaults(&ctx, "it_uninit", DataTypeInformation::default())
        .err()
        .expect("Publisher created without initialize");
    assert!(matches!(err, Error::NotInitialized));
    assert!(matches!(
        Subscriber::with_defaults(&ctx, "it_uninit", DataTypeInformation::default()),
        Err(Error::NotInitialized)
    ));
    assert!(ctx.topic_names().is_empty());
}

#[test]
fn test_operations_after_finalize_fail_cleanly() {
    let ctx = Context::new("it_after_finalize", config()).expect("Failed to create context");
    ctx.initialize().expect("Failed to initialize");
    let publisher = Publisher::with_defaults(&ctx, "it_after", DataTypeInformation::default())
        .expect("Failed to create publisher");
    let subscriber = Subscriber::with_defaults(&ctx, "it_after", DataTypeInformation::default())
        .expect("Failed to create subscriber");
    let client = ServiceClient::new(&ctx, "it_after_svc", Vec::new())
        .expect("Failed to create client");

    let start = Instant::now();
    assert_eq!(ctx.finalize(), FinalizeState::Finalized);
    assert!(start.elapsed() < Duration::from_secs(5));

    assert!(!publisher.send(b"too late", -1));
    assert!(subscriber.receive(0).is_none());
    assert!(client.client_instances().is_empty());
    let err = client
        .call_with_response("any", b"", 100)
        .expect_err("Call after finalize succeeded");
    assert!(matches!(
        err.kind,
        CallErrorKind::StoppedByUser | CallErrorKind::UnknownServer
    ));

    // handles outlive the runtime and drop without blocking
    drop(publisher);
    drop(subscriber);
    drop(client);
}

#[test]
fn test_reinitialize_after_finalize() {
    let ctx = Context::new("it_reinit", config()).expect("Failed to create context");
    ctx.initialize().expect("Failed to initialize");
    ctx.finalize();
    assert_eq!(ctx.initialize().expect("Failed to initialize"), InitState::Initialized);
    let publisher = Publisher::with_defaults(&ctx, "it_reinit", DataTypeInformation::default())
        .expect("Failed to create publisher");
    assert!(publisher.send(b"again", -1));
    ctx.finalize();
}
