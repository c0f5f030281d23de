// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service client: one connection per matched server instance.
//!
//! Calls are pipelined on the connection. Each outstanding request sits
//! in a `DashMap` keyed by request id until the connection's reader
//! thread routes the response to it, the call times out, or the
//! connection goes away.

use super::error::{CallErrorKind, ServiceError, ServiceResult};
use super::protocol::{peek_request_id, RequestFrame, ResponseFrame};
use super::types::{ClientEvent, ServiceMethodInformation, ServiceResponse};
use crate::callback::{guarded, EventCallback, ResponseCallback};
use crate::config::TCP_MAX_FRAME_SIZE;
use crate::context::{Context, LocalEntity, Runtime};
use crate::entity::{EntityId, ServiceId};
use crate::error::{validate_name, Result};
use crate::registration::{EntityKind, MethodRegistration, RegistrationSample};
use crate::transport::tcp::FrameCodec;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_POLL: Duration = Duration::from_millis(100);

enum Reply {
    Blocking(Sender<ServiceResult<ServiceResponse>>),
    Callback(Arc<dyn ResponseCallback>),
}

struct PendingCall {
    method: ServiceMethodInformation,
    reply: Reply,
}

impl PendingCall {
    fn complete(self, result: ServiceResult<ServiceResponse>, server: &ServiceId) {
        match self.reply {
            // the waiter may have timed out already
            Reply::Blocking(tx) => drop(tx.send(result)),
            Reply::Callback(callback) => {
                let response = result.unwrap_or_else(|e| {
                    ServiceResponse::failure(server.clone(), self.method, &e)
                });
                guarded("SERVICE", || callback.on_response(&response));
            }
        }
    }
}

/// Connection to one server instance.
struct Connection {
    server: ServiceId,
    port: u16,
    stream: Mutex<TcpStream>,
    pending: Arc<DashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn open(server: ServiceId, port: u16, client: Weak<ClientInner>) -> io::Result<Arc<Self>> {
        let stream = TcpStream::connect_timeout(&target(&server.service_id, port)?, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_POLL))?;
        let read_half = stream.try_clone()?;

        let pending = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let session = ReaderSession {
            server: server.clone(),
            stream: read_half,
            pending: Arc::clone(&pending),
            alive: Arc::clone(&alive),
            stop: Arc::clone(&stop),
            client,
        };
        let handle = thread::Builder::new()
            .name("meshbus-svc-client".to_string())
            .spawn(move || session.run())?;

        log::debug!(
            "[SERVICE] connected to server {} of '{}' on port {}",
            server.service_id,
            server.service_name,
            port
        );
        Ok(Arc::new(Self {
            server,
            port,
            stream: Mutex::new(stream),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            stop,
            reader: Mutex::new(Some(handle)),
        }))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue one request; `reply` is completed exactly once.
    fn submit(&self, method: &ServiceMethodInformation, request: &[u8], reply: Reply) -> ServiceResult<u64> {
        if !self.is_alive() {
            return Err(ServiceError::new(CallErrorKind::ConnectionClosed));
        }
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.insert(
            request_id,
            PendingCall {
                method: method.clone(),
                reply,
            },
        );
        let frame = RequestFrame {
            request_id,
            method: method.method_name.clone(),
            request: request.to_vec(),
        };
        let written = FrameCodec::write_frame(&mut *self.stream.lock(), &frame.encode());
        if let Err(e) = written {
            self.pending.remove(&request_id);
            return Err(ServiceError::with_message(
                CallErrorKind::ConnectionClosed,
                e.to_string(),
            ));
        }
        Ok(request_id)
    }

    /// Stop the reader and fail every outstanding call with `kind`.
    fn close(&self, kind: CallErrorKind) {
        self.alive.store(false, Ordering::Release);
        self.stop.store(true, Ordering::Release);
        let _ = self.stream.lock().shutdown(std::net::Shutdown::Both);
        fail_all(&self.pending, &self.server, kind);
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(CallErrorKind::ConnectionClosed);
    }
}

fn fail_all(pending: &DashMap<u64, PendingCall>, server: &ServiceId, kind: CallErrorKind) {
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, call)) = pending.remove(&id) {
            call.complete(Err(ServiceError::new(kind)), server);
        }
    }
}

fn target(server: &EntityId, port: u16) -> io::Result<SocketAddr> {
    if server.is_local_host() {
        return Ok(SocketAddr::from(([127, 0, 0, 1], port)));
    }
    (server.host_name.as_str(), port)
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no IPv4 address for host '{}'", server.host_name),
            )
        })
}

struct ReaderSession {
    server: ServiceId,
    stream: TcpStream,
    pending: Arc<DashMap<u64, PendingCall>>,
    alive: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    client: Weak<ClientInner>,
}

impl ReaderSession {
    fn run(mut self) {
        let (kind, reason) = self.read_responses();
        self.alive.store(false, Ordering::Release);
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        log::debug!(
            "[SERVICE] connection to server {} lost: {}",
            self.server.service_id,
            reason
        );
        fail_all(&self.pending, &self.server, kind);
        if let Some(client) = self.client.upgrade() {
            client.connection_lost(&self.server);
        }
    }

    fn read_responses(&mut self) -> (CallErrorKind, String) {
        let mut codec = FrameCodec::new(TCP_MAX_FRAME_SIZE);
        while !self.stop.load(Ordering::Acquire) {
            let body = match codec.decode(&mut self.stream) {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    return (CallErrorKind::ProtocolError, e.to_string());
                }
                Err(e) => return (CallErrorKind::ConnectionClosed, e.to_string()),
            };
            match ResponseFrame::decode(&body) {
                Ok(frame) => self.route(frame),
                Err(e) => match peek_request_id(&body) {
                    // a readable id: only that call is lost
                    Ok(id) => {
                        if let Some((_, call)) = self.pending.remove(&id) {
                            let error =
                                ServiceError::with_message(CallErrorKind::ProtocolError, e.to_string());
                            call.complete(Err(error), &self.server);
                        }
                    }
                    Err(_) => return (CallErrorKind::ProtocolError, format!("malformed response: {e}")),
                },
            }
        }
        (CallErrorKind::StoppedByUser, "stopped".to_string())
    }

    fn route(&self, frame: ResponseFrame) {
        let Some((_, call)) = self.pending.remove(&frame.request_id) else {
            log::debug!(
                "[SERVICE] response {} from server {} matches no pending call",
                frame.request_id,
                self.server.service_id
            );
            return;
        };
        let response = ServiceResponse {
            call_state: frame.call_state,
            server_id: self.server.clone(),
            method: call.method.clone(),
            ret_state: frame.ret_state,
            response: frame.response,
            error_msg: frame.error_msg,
            error_kind: frame.error_kind,
        };
        call.complete(Ok(response), &self.server);
    }
}

pub(crate) struct ClientInner {
    runtime: Arc<Runtime>,
    self_ref: Weak<ClientInner>,
    service_id: ServiceId,
    methods: Vec<ServiceMethodInformation>,
    call_counts: DashMap<String, u64>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    event_callback: RwLock<Option<Arc<dyn EventCallback<ClientEvent>>>>,
    closed: AtomicBool,
}

/// Calls the server instances of one service name.
///
/// # Example
///
/// ```no_run
/// use meshbus::config::Config;
/// use meshbus::context::Context;
/// use meshbus::service::{ServiceClient, ServiceMethodInformation};
///
/// let ctx = Context::new("math_client", Config::default()).expect("config");
/// ctx.initialize().expect("init");
/// let client = ServiceClient::new(&ctx, "math", vec![ServiceMethodInformation::new("echo")])
///     .expect("client");
/// for instance in client.client_instances() {
///     match instance.call_with_response("echo", b"ping", 1000) {
///         Ok(response) => println!("{:?}", response.response),
///         Err(e) => eprintln!("call failed: {}", e),
///     }
/// }
/// ```
pub struct ServiceClient {
    inner: Arc<ClientInner>,
}

impl ServiceClient {
    pub fn new(
        ctx: &Context,
        service_name: &str,
        methods: Vec<ServiceMethodInformation>,
    ) -> Result<Self> {
        validate_name(service_name)?;
        let runtime = ctx.runtime()?;
        let call_counts = methods
            .iter()
            .map(|m| (m.method_name.clone(), 0))
            .collect();
        let inner = Arc::new_cyclic(|self_ref| ClientInner {
            runtime: Arc::clone(&runtime),
            self_ref: self_ref.clone(),
            service_id: ServiceId::new(EntityId::generate(), service_name),
            methods,
            call_counts,
            connections: Mutex::new(HashMap::new()),
            event_callback: RwLock::new(None),
            closed: AtomicBool::new(false),
        });
        log::debug!(
            "[SERVICE] client for '{}' id={} created",
            service_name,
            inner.service_id.service_id
        );
        runtime.register(Arc::clone(&inner) as Arc<dyn LocalEntity>);
        Ok(Self { inner })
    }

    /// One handle per server instance currently in the directory.
    pub fn client_instances(&self) -> Vec<ClientInstance> {
        if self.inner.is_closed() {
            return Vec::new();
        }
        let mut servers = self
            .inner
            .runtime
            .match_set(&self.inner.service_id.service_name, EntityKind::Client);
        servers.sort_by_key(|s| s.entity.entity_id);
        servers
            .into_iter()
            .map(|s| ClientInstance {
                server: s.service_id(),
                client: Arc::clone(&self.inner),
            })
            .collect()
    }

    /// Blocking call on every instance. `UnknownServer` when there is none.
    pub fn call_with_response(
        &self,
        method: &str,
        request: &[u8],
        timeout_ms: i64,
    ) -> ServiceResult<Vec<ServiceResponse>> {
        if self.inner.is_closed() {
            return Err(ServiceError::new(CallErrorKind::StoppedByUser));
        }
        let instances = self.client_instances();
        if instances.is_empty() {
            return Err(ServiceError::with_message(
                CallErrorKind::UnknownServer,
                self.inner.service_id.service_name.clone(),
            ));
        }
        Ok(instances
            .iter()
            .map(|instance| {
                instance
                    .call_with_response(method, request, timeout_ms)
                    .unwrap_or_else(|e| {
                        ServiceResponse::failure(
                            instance.server.clone(),
                            self.inner.method_info(method),
                            &e,
                        )
                    })
            })
            .collect())
    }

    /// Blocking call on every instance; `callback` runs once per
    /// instance before this returns. True when at least one executed.
    pub fn call_with_callback<C: ResponseCallback>(
        &self,
        method: &str,
        request: &[u8],
        callback: C,
        timeout_ms: i64,
    ) -> bool {
        let callback: Arc<dyn ResponseCallback> = Arc::new(callback);
        let mut executed = false;
        for instance in self.client_instances() {
            executed |= instance.call_with_callback_shared(method, request, &callback, timeout_ms);
        }
        executed
    }

    /// Non-blocking call on every instance.
    pub fn call_with_callback_async<C: ResponseCallback>(
        &self,
        method: &str,
        request: &[u8],
        callback: C,
    ) -> bool {
        let callback: Arc<dyn ResponseCallback> = Arc::new(callback);
        let mut submitted = false;
        for instance in self.client_instances() {
            submitted |= instance.submit_async(method, request, Arc::clone(&callback));
        }
        submitted
    }

    pub fn set_event_callback<C: EventCallback<ClientEvent>>(&self, callback: C) -> bool {
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

    /// Open connections to server instances.
    pub fn is_connected(&self) -> bool {
        self.inner
            .connections
            .lock()
            .values()
            .any(|c| c.is_alive())
    }

    /// Calls issued for `method` so far.
    pub fn call_count(&self, method: &str) -> u64 {
        self.inner.call_counts.get(method).map_or(0, |c| *c)
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.inner.runtime.unregister(self.inner.as_ref());
        self.inner.close();
    }
}

/// One server instance as seen from a client.
#[derive(Clone)]
pub struct ClientInstance {
    server: ServiceId,
    client: Arc<ClientInner>,
}

impl ClientInstance {
    pub fn server_id(&self) -> &ServiceId {
        &self.server
    }

    /// Send one request and wait for its response (`-1` waits forever).
    ///
    /// A response the server produced, even a failed one such as an
    /// unknown method, is `Ok`; `Err` means the call never completed.
    pub fn call_with_response(
        &self,
        method: &str,
        request: &[u8],
        timeout_ms: i64,
    ) -> ServiceResult<ServiceResponse> {
        let connection = self.client.connection_for(&self.server)?;
        let info = self.client.method_info(method);
        self.client.count_call(method);

        let (tx, rx) = bounded(1);
        let request_id = connection.submit(&info, request, Reply::Blocking(tx))?;
        let result = if timeout_ms < 0 {
            rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
        } else {
            rx.recv_timeout(Duration::from_millis(timeout_ms as u64))
        };
        match result {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if connection.pending.remove(&request_id).is_none() {
                    // completed between the timeout and the removal
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                log::debug!(
                    "[SERVICE] call '{}' to server {} timed out after {} ms",
                    method,
                    self.server.service_id,
                    timeout_ms
                );
                Err(ServiceError::new(CallErrorKind::Timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(ServiceError::new(CallErrorKind::ConnectionClosed))
            }
        }
    }

    /// Blocking call; `callback` runs before this returns, with a failure
    /// response when the call did not complete. True when executed.
    pub fn call_with_callback<C: ResponseCallback>(
        &self,
        method: &str,
        request: &[u8],
        callback: C,
        timeout_ms: i64,
    ) -> bool {
        let callback: Arc<dyn ResponseCallback> = Arc::new(callback);
        self.call_with_callback_shared(method, request, &callback, timeout_ms)
    }

    /// Returns once the request is sent; `callback` runs on the
    /// connection's reader thread. False when it could not be sent.
    pub fn call_with_callback_async<C: ResponseCallback>(
        &self,
        method: &str,
        request: &[u8],
        callback: C,
    ) -> bool {
        self.submit_async(method, request, Arc::new(callback))
    }

    fn call_with_callback_shared(
        &self,
        method: &str,
        request: &[u8],
        callback: &Arc<dyn ResponseCallback>,
        timeout_ms: i64,
    ) -> bool {
        let response = self
            .call_with_response(method, request, timeout_ms)
            .unwrap_or_else(|e| {
                ServiceResponse::failure(self.server.clone(), self.client.method_info(method), &e)
            });
        guarded("SERVICE", || callback.on_response(&response));
        response.is_executed()
    }

    fn submit_async(&self, method: &str, request: &[u8], callback: Arc<dyn ResponseCallback>) -> bool {
        let connection = match self.client.connection_for(&self.server) {
            Ok(connection) => connection,
            Err(e) => {
                log::debug!("[SERVICE] async call '{}' not sent: {}", method, e);
                return false;
            }
        };
        let info = self.client.method_info(method);
        self.client.count_call(method);
        match connection.submit(&info, request, Reply::Callback(callback)) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("[SERVICE] async call '{}' not sent: {}", method, e);
                false
            }
        }
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.runtime.is_stopped()
    }

    fn method_info(&self, method: &str) -> ServiceMethodInformation {
        self.methods
            .iter()
            .find(|m| m.method_name == method)
            .cloned()
            .unwrap_or_else(|| ServiceMethodInformation::new(method))
    }

    fn count_call(&self, method: &str) {
        *self.call_counts.entry(method.to_string()).or_insert(0) += 1;
    }

    /// Live connection to `server`, opened on demand.
    fn connection_for(&self, server: &ServiceId) -> ServiceResult<Arc<Connection>> {
        if self.is_closed() {
            return Err(ServiceError::new(CallErrorKind::StoppedByUser));
        }
        let Some(sample) = self.runtime.lookup(server.service_id.entity_id) else {
            return Err(ServiceError::with_message(
                CallErrorKind::UnknownServer,
                format!("server {} is gone", server.service_id),
            ));
        };
        if let Some(connection) = self.connections.lock().get(&server.service_id.entity_id) {
            if connection.is_alive() && connection.port == sample.service_port {
                return Ok(Arc::clone(connection));
            }
        }
        self.connect(&sample).ok_or_else(|| {
            ServiceError::with_message(
                CallErrorKind::ConnectionClosed,
                format!("cannot reach server {}", server.service_id),
            )
        })
    }

    fn connect(&self, server: &RegistrationSample) -> Option<Arc<Connection>> {
        if server.service_port == 0 {
            return None;
        }
        let server_id = server.service_id();
        let connection =
            match Connection::open(server_id.clone(), server.service_port, self.self_ref.clone()) {
                Ok(connection) => connection,
                Err(e) => {
                    log::debug!(
                        "[SERVICE] connect to server {} port {} failed: {}",
                        server.entity,
                        server.service_port,
                        e
                    );
                    return None;
                }
            };
        let replaced = self
            .connections
            .lock()
            .insert(server.entity.entity_id, Arc::clone(&connection));
        // joins the old reader, outside the lock
        drop(replaced);
        if self.is_closed() {
            connection.close(CallErrorKind::StoppedByUser);
            return None;
        }
        self.emit(ClientEvent::Connected { server: server_id });
        Some(connection)
    }

    fn connection_lost(&self, server: &ServiceId) {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(&server.service_id.entity_id) {
                Some(c) if !c.is_alive() => connections.remove(&server.service_id.entity_id),
                _ => None,
            }
        };
        if removed.is_some() {
            self.emit(ClientEvent::Disconnected {
                server: server.clone(),
            });
        }
    }

    fn emit(&self, event: ClientEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            guarded("SERVICE", || callback.on_event(&event));
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close(CallErrorKind::StoppedByUser);
        }
        drop(connections);
        self.event_callback.write().take();
        log::debug!(
            "[SERVICE] client for '{}' stopped",
            self.service_id.service_name
        );
    }
}

impl LocalEntity for ClientInner {
    fn entity_id(&self) -> u64 {
        self.service_id.service_id.entity_id
    }

    fn kind(&self) -> EntityKind {
        EntityKind::Client
    }

    fn name(&self) -> &str {
        &self.service_id.service_name
    }

    fn registration(&self) -> RegistrationSample {
        let mut sample = RegistrationSample::new(
            EntityKind::Client,
            self.service_id.service_id.clone(),
            self.service_id.service_name.clone(),
        );
        sample.unit_name = self.runtime.unit_name().to_string();
        let mut methods: Vec<MethodRegistration> = self
            .call_counts
            .iter()
            .map(|entry| MethodRegistration {
                info: self.method_info(entry.key()),
                call_count: *entry.value(),
            })
            .collect();
        methods.sort_by(|a, b| a.info.method_name.cmp(&b.info.method_name));
        sample.methods = methods;
        sample.connections = self.connections.lock().len() as u32;
        sample
    }

    fn on_peer_registered(&self, peer: &RegistrationSample) {
        if self.is_closed() || peer.service_port == 0 {
            return;
        }
        let known = self
            .connections
            .lock()
            .get(&peer.entity.entity_id)
            .is_some_and(|c| c.is_alive() && c.port == peer.service_port);
        if !known {
            self.connect(peer);
        }
    }

    fn on_peer_removed(&self, peer: &RegistrationSample) {
        let removed = self.connections.lock().remove(&peer.entity.entity_id);
        if let Some(connection) = removed {
            connection.close(CallErrorKind::ConnectionClosed);
            self.emit(ClientEvent::Disconnected {
                server: peer.service_id(),
            });
        }
    }

    fn shutdown(&self) {
        self.close();
    }
}
