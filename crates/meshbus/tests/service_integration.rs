// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client/server integration tests.

use meshbus::config::Config;
use meshbus::service::{
    CallErrorKind, CallState, ClientEvent, ServiceClient, ServiceMethodInformation,
    ServiceResponse, ServiceServer,
};
use meshbus::{Context, DataTypeInformation};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn context(unit: &str) -> Context {
    let mut cfg = Config::default();
    cfg.registration.udp_enable = false;
    cfg.registration.refresh_ms = 50;
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

fn echo_server(ctx: &Context, name: &str) -> ServiceServer {
    let server = ServiceServer::new(ctx, name).expect("Failed to create server");
    assert!(server.set_method_callback(
        ServiceMethodInformation::new("echo").with_types(
            DataTypeInformation::new("bytes", "raw"),
            DataTypeInformation::new("bytes", "raw"),
        ),
        |_: &ServiceMethodInformation, req: &[u8]| (7, req.to_vec()),
    ));
    assert!(server.set_method_callback(
        ServiceMethodInformation::new("slow"),
        |_: &ServiceMethodInformation, _: &[u8]| {
            thread::sleep(Duration::from_millis(300));
            (0, Vec::new())
        },
    ));
    server
}

fn connected_client(ctx: &Context, name: &str) -> ServiceClient {
    let client = ServiceClient::new(ctx, name, vec![ServiceMethodInformation::new("echo")])
        .expect("Failed to create client");
    assert!(wait_until(Duration::from_secs(3), || client.is_connected()));
    client
}

#[test]
fn test_echo_with_all_calling_conventions() {
    let ctx = context("it_svc_echo");
    let _server = echo_server(&ctx, "it_echo");
    let client = connected_client(&ctx, "it_echo");
    let echo = ctx
        .services()
        .into_iter()
        .find(|s| s.service_id.service_name == "it_echo")
        .and_then(|s| s.methods.into_iter().find(|m| m.info.method_name == "echo"))
        .expect("Failed to find echo method in directory");
    assert_eq!(echo.info.request_type, DataTypeInformation::new("bytes", "raw"));
    assert_eq!(echo.info.response_type.name, "bytes");

    let responses = client
        .call_with_response("echo", b"ping", 1_000)
        .expect("Failed to call echo");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].call_state, CallState::Executed);
    assert_eq!(responses[0].ret_state, 7);
    assert_eq!(responses[0].response, b"ping");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    assert!(client.call_with_callback(
        "echo",
        b"blocking",
        move |r: &ServiceResponse| seen_clone.lock().push(r.response.clone()),
        1_000,
    ));
    assert_eq!(*seen.lock(), vec![b"blocking".to_vec()]);

    let seen_clone = Arc::clone(&seen);
    assert!(client.call_with_callback_async(
        "echo",
        b"async",
        move |r: &ServiceResponse| seen_clone.lock().push(r.response.clone()),
    ));
    assert!(wait_until(Duration::from_secs(3), || seen.lock().len() == 2));
    assert_eq!(seen.lock()[1], b"async".to_vec());
    assert_eq!(client.call_count("echo"), 3);
    ctx.finalize();
}

#[test]
fn test_unknown_method_is_a_failed_response() {
    let ctx = context("it_svc_missing");
    let _server = echo_server(&ctx, "it_missing");
    let client = connected_client(&ctx, "it_missing");

    let instance = client
        .client_instances()
        .pop()
        .expect("Failed to find server instance");
    let response = instance
        .call_with_response("nope", b"", 1_000)
        .expect("Failed to get a response");
    assert_eq!(response.call_state, CallState::Failed);
    assert_eq!(response.error_kind, Some(CallErrorKind::MethodNotFound));
    ctx.finalize();
}

#[test]
fn test_call_after_server_left_is_unknown_server() {
    let ctx = context("it_svc_gone");
    let server = echo_server(&ctx, "it_gone");
    let client = connected_client(&ctx, "it_gone");
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    client.set_event_callback(move |e: &ClientEvent| events_clone.lock().push(e.clone()));

    let instance = client
        .client_instances()
        .pop()
        .expect("Failed to find server instance");
    drop(server);
    assert!(wait_until(Duration::from_secs(3), || client.client_instances().is_empty()));

    let err = instance
        .call_with_response("echo", b"late", 500)
        .expect_err("Call to a departed server succeeded");
    assert_eq!(err.kind, CallErrorKind::UnknownServer);

    let err = client
        .call_with_response("echo", b"late", 500)
        .expect_err("Call without instances succeeded");
    assert_eq!(err.kind, CallErrorKind::UnknownServer);
    assert!(events
        .lock()
        .iter()
        .any(|e| matches!(e, ClientEvent::Disconnected { .. })));
    ctx.finalize();
}

#[test]
fn test_timeout_then_connection_still_usable() {
    let ctx = context("it_svc_timeout");
    let _server = echo_server(&ctx, "it_timeout");
    let client = connected_client(&ctx, "it_timeout");
    let instance = client
        .client_instances()
        .pop()
        .expect("Failed to find server instance");

    let start = Instant::now();
    let err = instance
        .call_with_response("slow", b"", 50)
        .expect_err("Slow call did not time out");
    assert_eq!(err.kind, CallErrorKind::Timeout);
    assert!(start.elapsed() < Duration::from_millis(250));

    let responses = client
        .call_with_response("slow", b"", 50)
        .expect("Failed to call slow");
    assert_eq!(responses[0].call_state, CallState::Timeouted);

    // the late responses are discarded, later calls still match up
    let response = instance
        .call_with_response("echo", b"after", 2_000)
        .expect("Failed to call echo");
    assert_eq!(response.response, b"after");
    ctx.finalize();
}
