// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service server: listens on an ephemeral TCP port advertised in its
//! registration and answers requests with the registered method
//! callbacks.
//!
//! ```text
//!   meshbus-svc-accept ──accept──> meshbus-svc-session (one per client)
//!                                     │ RequestFrame
//!                                     v
//!                               method callback ──> ResponseFrame
//! ```
//!
//! Requests of one session are answered in order.

use super::error::CallErrorKind;
use super::protocol::{RequestFrame, ResponseFrame};
use super::types::{CallState, ServerEvent, ServiceMethodInformation};
use crate::callback::{guarded, EventCallback, MethodCallback};
use crate::config::TCP_MAX_FRAME_SIZE;
use crate::context::{Context, LocalEntity, Runtime};
use crate::entity::{EntityId, ServiceId};
use crate::error::{validate_name, Result};
use crate::registration::{EntityKind, MethodRegistration, RegistrationSample};
use crate::transport::tcp::FrameCodec;
use crate::transport::LayerSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_POLL: Duration = Duration::from_millis(100);

struct MethodEntry {
    info: ServiceMethodInformation,
    callback: Arc<dyn MethodCallback>,
    call_count: AtomicU64,
}

pub(crate) struct ServerInner {
    runtime: Arc<Runtime>,
    service_id: ServiceId,
    port: u16,
    methods: RwLock<HashMap<String, Arc<MethodEntry>>>,
    event_callback: RwLock<Option<Arc<dyn EventCallback<ServerEvent>>>>,
    sessions: AtomicUsize,
    stop: Arc<AtomicBool>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

/// Answers calls on one service name.
///
/// # Example
///
/// ```no_run
/// use meshbus::config::Config;
/// use meshbus::context::Context;
/// use meshbus::service::{ServiceMethodInformation, ServiceServer};
///
/// let ctx = Context::new("math_server", Config::default()).expect("config");
/// ctx.initialize().expect("init");
/// let server = ServiceServer::new(&ctx, "math").expect("server");
/// server.set_method_callback(
///     ServiceMethodInformation::new("echo"),
///     |_: &ServiceMethodInformation, request: &[u8]| (0, request.to_vec()),
/// );
/// ```
pub struct ServiceServer {
    inner: Arc<ServerInner>,
}

impl ServiceServer {
    pub fn new(ctx: &Context, service_name: &str) -> Result<Self> {
        validate_name(service_name)?;
        let runtime = ctx.runtime()?;
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let stop = Arc::new(AtomicBool::new(false));
        let inner = Arc::new(ServerInner {
            runtime: Arc::clone(&runtime),
            service_id: ServiceId::new(EntityId::generate(), service_name),
            port,
            methods: RwLock::new(HashMap::new()),
            event_callback: RwLock::new(None),
            sessions: AtomicUsize::new(0),
            stop: Arc::clone(&stop),
            acceptor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let handle = thread::Builder::new()
            .name("meshbus-svc-accept".to_string())
            .spawn(move || accept_loop(listener, weak, &stop))?;
        *inner.acceptor.lock() = Some(handle);

        log::info!(
            "[SERVICE] server '{}' id={} listening on port {}",
            service_name,
            inner.service_id.service_id,
            port
        );
        runtime.register(Arc::clone(&inner) as Arc<dyn LocalEntity>);
        Ok(Self { inner })
    }

    /// Install the callback for `method`, replacing any previous one.
    pub fn set_method_callback<C: MethodCallback>(
        &self,
        method: ServiceMethodInformation,
        callback: C,
    ) -> bool {
        if self.inner.is_closed() {
            return false;
        }
        let name = method.method_name.clone();
        {
            let mut methods = self.inner.methods.write();
            // the call counter survives a replacement
            let calls = methods
                .get(&name)
                .map_or(0, |m| m.call_count.load(Ordering::Acquire));
            methods.insert(
                name,
                Arc::new(MethodEntry {
                    info: method,
                    callback: Arc::new(callback),
                    call_count: AtomicU64::new(calls),
                }),
            );
        }
        self.inner.runtime.refresh_entity(self.inner.as_ref());
        true
    }

    /// Remove the callback for `method_name`; false when none is set.
    pub fn remove_method_callback(&self, method_name: &str) -> bool {
        let removed = self.inner.methods.write().remove(method_name).is_some();
        if removed {
            self.inner.runtime.refresh_entity(self.inner.as_ref());
        }
        removed
    }

    pub fn set_event_callback<C: EventCallback<ServerEvent>>(&self, callback: C) -> bool {
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

    pub fn service_id(&self) -> &ServiceId {
        &self.inner.service_id
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_id.service_name
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// At least one client session is open.
    pub fn is_connected(&self) -> bool {
        self.inner.sessions.load(Ordering::Acquire) > 0
    }
}

impl Drop for ServiceServer {
    fn drop(&mut self) {
        self.inner.runtime.unregister(self.inner.as_ref());
        self.inner.close();
    }
}

impl ServerInner {
    fn is_closed(&self) -> bool {
        self.stop.load(Ordering::Acquire) || self.runtime.is_stopped()
    }

    fn close(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = self.acceptor.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        self.event_callback.write().take();
        log::info!(
            "[SERVICE] server '{}' stopped",
            self.service_id.service_name
        );
    }

    fn emit(&self, event: ServerEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            guarded("SERVICE", || callback.on_event(&event));
        }
    }

    fn execute(&self, request: RequestFrame) -> ResponseFrame {
        let entry = self.methods.read().get(&request.method).cloned();
        let Some(entry) = entry else {
            log::debug!(
                "[SERVICE] '{}': no callback for method '{}'",
                self.service_id.service_name,
                request.method
            );
            return ResponseFrame {
                request_id: request.request_id,
                call_state: CallState::Failed,
                error_kind: Some(CallErrorKind::MethodNotFound),
                ret_state: 0,
                error_msg: format!("method '{}' not found", request.method),
                response: Vec::new(),
            };
        };
        entry.call_count.fetch_add(1, Ordering::AcqRel);
        match guarded("SERVICE", || entry.callback.call(&entry.info, &request.request)) {
            Some((ret_state, response)) => ResponseFrame {
                request_id: request.request_id,
                call_state: CallState::Executed,
                error_kind: None,
                ret_state,
                error_msg: String::new(),
                response,
            },
            None => ResponseFrame {
                request_id: request.request_id,
                call_state: CallState::Failed,
                error_kind: Some(CallErrorKind::Failed),
                ret_state: 0,
                error_msg: format!("method '{}' panicked", request.method),
                response: Vec::new(),
            },
        }
    }
}

impl LocalEntity for ServerInner {
    fn entity_id(&self) -> u64 {
        self.service_id.service_id.entity_id
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Server
    }

    fn name(&self) -> &str {
        &self.service_id.service_name
    }

    fn registration(&self) -> RegistrationSample {
        let mut sample = RegistrationSample::new(
            EntityKind::Server,
            self.service_id.service_id.clone(),
            self.service_id.service_name.clone(),
        );
        sample.unit_name = self.runtime.unit_name().to_string();
        sample.layers = LayerSet::empty();
        sample.service_port = self.port;
        let mut methods: Vec<MethodRegistration> = self
            .methods
            .read()
            .values()
            .map(|m| MethodRegistration {
                info: m.info.clone(),
                call_count: m.call_count.load(Ordering::Acquire),
            })
            .collect();
        methods.sort_by(|a, b| a.info.method_name.cmp(&b.info.method_name));
        sample.methods = methods;
        sample.connections = self.sessions.load(Ordering::Acquire) as u32;
        sample
    }

    fn on_peer_registered(&self, _peer: &RegistrationSample) {}

    fn on_peer_removed(&self, _peer: &RegistrationSample) {}

    fn shutdown(&self) {
        self.close();
    }
}

fn accept_loop(listener: TcpListener, server: Weak<ServerInner>, stop: &AtomicBool) {
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    let session_stop = Arc::new(AtomicBool::new(false));

    while !stop.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, remote)) => {
                let server = server.clone();
                let session_stop = Arc::clone(&session_stop);
                let spawned = thread::Builder::new()
                    .name("meshbus-svc-session".to_string())
                    .spawn(move || run_session(stream, remote, &server, &session_stop));
                match spawned {
                    Ok(handle) => sessions.push(handle),
                    Err(e) => log::warn!("[SERVICE] cannot spawn session for {}: {}", remote, e),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::debug!("[SERVICE] accept error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
        sessions.retain(|h| !h.is_finished());
    }

    session_stop.store(true, Ordering::Release);
    for handle in sessions {
        let _ = handle.join();
    }
}

fn run_session(stream: TcpStream, remote: SocketAddr, server: &Weak<ServerInner>, stop: &AtomicBool) {
    if let Err(e) = prepare_stream(&stream) {
        log::debug!("[SERVICE] session {} setup failed: {}", remote, e);
        return;
    }
    if let Some(inner) = server.upgrade() {
        inner.sessions.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "[SERVICE] '{}': client session from {}",
            inner.service_id.service_name,
            remote
        );
        inner.emit(ServerEvent::Connected { client: remote });
    } else {
        return;
    }

    let reason = serve(&stream, server, stop);
    log::debug!("[SERVICE] session {} closed: {}", remote, reason);

    if let Some(inner) = server.upgrade() {
        inner.sessions.fetch_sub(1, Ordering::AcqRel);
        inner.emit(ServerEvent::Disconnected { client: remote });
    }
}

fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(READ_POLL))
}

fn serve(mut stream: &TcpStream, server: &Weak<ServerInner>, stop: &AtomicBool) -> String {
    let mut codec = FrameCodec::new(TCP_MAX_FRAME_SIZE);
    while !stop.load(Ordering::Acquire) {
        let body = match codec.decode(&mut stream) {
            Ok(Some(body)) => body,
            Ok(None) => continue,
            Err(e) => return e.to_string(),
        };
        let request = match RequestFrame::decode(&body) {
            Ok(request) => request,
            Err(e) => return format!("malformed request: {e}"),
        };
        let Some(inner) = server.upgrade() else {
            return "server dropped".to_string();
        };
        let response = inner.execute(request);
        drop(inner);
        if let Err(e) = FrameCodec::write_frame(&mut stream, &response.encode()) {
            return format!("write failed: {e}");
        }
    }
    "server stopped".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn context() -> Context {
        let mut cfg = Config::default();
        cfg.registration.udp_enable = false;
        let ctx = Context::new("server_unit", cfg).expect("Failed to create context");
        ctx.initialize().expect("Failed to initialize");
        ctx
    }

    fn roundtrip(port: u16, request: &RequestFrame) -> ResponseFrame {
        let mut stream =
            TcpStream::connect(("127.0.0.1", port)).expect("Failed to connect to server");
        FrameCodec::write_frame(&mut stream, &request.encode()).expect("Failed to write");
        let mut codec = FrameCodec::new(1024);
        let body = loop {
            if let Some(body) = codec.decode(&mut stream).expect("Failed to read") {
                break body;
            }
        };
        ResponseFrame::decode(&body).expect("Failed to decode response")
    }

    #[test]
    fn test_execute_known_and_unknown_method() {
        let ctx = context();
        let server = ServiceServer::new(&ctx, "svc_unit").expect("Failed to create server");
        assert!(server.set_method_callback(
            ServiceMethodInformation::new("echo"),
            |_: &ServiceMethodInformation, req: &[u8]| (7, req.to_vec()),
        ));

        let ok = roundtrip(
            server.port(),
            &RequestFrame {
                request_id: 1,
                method: "echo".to_string(),
                request: b"ping".to_vec(),
            },
        );
        assert_eq!(ok.call_state, CallState::Executed);
        assert_eq!(ok.ret_state, 7);
        assert_eq!(ok.response, b"ping");

        let missing = roundtrip(
            server.port(),
            &RequestFrame {
                request_id: 2,
                method: "nope".to_string(),
                request: Vec::new(),
            },
        );
        assert_eq!(missing.call_state, CallState::Failed);
        assert_eq!(missing.error_kind, Some(CallErrorKind::MethodNotFound));

        let reg = server.inner.registration();
        assert_eq!(reg.service_port, server.port());
        assert_eq!(reg.methods.len(), 1);
        assert_eq!(reg.methods[0].call_count, 1);
        ctx.finalize();
    }

    #[test]
    fn test_remove_method_callback() {
        let ctx = context();
        let server = ServiceServer::new(&ctx, "svc_remove").expect("Failed to create server");
        assert!(!server.remove_method_callback("echo"));
        server.set_method_callback(
            ServiceMethodInformation::new("echo"),
            |_: &ServiceMethodInformation, _: &[u8]| (0, Vec::new()),
        );
        assert!(server.remove_method_callback("echo"));
        assert!(!server.remove_method_callback("echo"));
        ctx.finalize();
        assert!(!server.set_method_callback(
            ServiceMethodInformation::new("echo"),
            |_: &ServiceMethodInformation, _: &[u8]| (0, Vec::new()),
        ));
    }

    #[test]
    fn test_panicking_method_reports_failure() {
        let ctx = context();
        let server = ServiceServer::new(&ctx, "svc_panic").expect("Failed to create server");
        server.set_method_callback(
            ServiceMethodInformation::new("boom"),
            |_: &ServiceMethodInformation, _: &[u8]| -> (i32, Vec<u8>) { panic!("boom") },
        );
        let resp = roundtrip(
            server.port(),
            &RequestFrame {
                request_id: 9,
                method: "boom".to_string(),
                request: Vec::new(),
            },
        );
        assert_eq!(resp.request_id, 9);
        assert_eq!(resp.call_state, CallState::Failed);
        assert_eq!(resp.error_kind, Some(CallErrorKind::Failed));
        ctx.finalize();
    }
}
