// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher side of the TCP layer.
//!
//! ```text
//! +--------------------------------------------------------+
//! |                    meshbus-tcp-pub                      |
//! |   mio::Poll                                             |
//! |    - listener (accept subscriber connections)           |
//! |    - sessions (hello frame in, sample frames out)       |
//! |    - waker    (Broadcast / Close commands)              |
//! +--------------------------------------------------------+
//! ```
//!
//! A session becomes a reader once its hello frame names the subscriber.
//! Each session queues at most `TCP_SESSION_QUEUE_DEPTH` frames; a slow
//! reader loses the newest frames instead of stalling the publisher.

use super::frame_codec::FrameCodec;
use super::{Hello, HELLO_MAX_FRAME};
use crate::config::TCP_SESSION_QUEUE_DEPTH;
use crate::entity::EntityId;
use crate::registration::RegistrationSample;
use crate::transport::{Envelope, Layer, LayerWriter, WriteContext};
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const SESSION_TOKEN_START: usize = 2;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_EVENTS: usize = 128;

enum WriterCommand {
    Broadcast(Arc<[u8]>),
    Close(u64),
    Shutdown,
}

pub struct TcpWriter {
    publisher_id: u64,
    port: u16,
    cmd_tx: Sender<WriterCommand>,
    waker: Arc<Waker>,
    readers: Arc<Mutex<HashSet<u64>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TcpWriter {
    /// Bind an ephemeral listener and start the I/O thread.
    pub fn new(publisher: &EntityId) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        let port = listener.local_addr()?.port();
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (cmd_tx, cmd_rx) = unbounded();
        let readers = Arc::new(Mutex::new(HashSet::new()));
        let running = Arc::new(AtomicBool::new(true));

        let io = IoLoop {
            publisher_id: publisher.entity_id,
            poll,
            listener,
            sessions: HashMap::new(),
            next_token: SESSION_TOKEN_START,
            cmd_rx,
            readers: Arc::clone(&readers),
            running: Arc::clone(&running),
        };
        let handle = thread::Builder::new()
            .name("meshbus-tcp-pub".to_string())
            .spawn(move || io.run())?;

        log::debug!("[TCP] publisher {} listening on port {}", publisher, port);
        Ok(Self {
            publisher_id: publisher.entity_id,
            port,
            cmd_tx,
            waker,
            readers,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn command(&self, cmd: WriterCommand) -> bool {
        if self.cmd_tx.send(cmd).is_err() {
            return false;
        }
        self.waker.wake().is_ok()
    }
}

impl LayerWriter for TcpWriter {
    fn layer(&self) -> Layer {
        Layer::Tcp
    }

    fn write(&self, ctx: &WriteContext<'_>, payload: &[u8]) -> bool {
        let frame: Arc<[u8]> = Arc::from(FrameCodec::encode(&Envelope::encode(
            &ctx.header(),
            payload,
        )));
        self.command(WriterCommand::Broadcast(frame))
    }

    fn connect(&self, _subscriber: &RegistrationSample) {}

    fn disconnect(&self, subscriber_id: &EntityId) {
        self.command(WriterCommand::Close(subscriber_id.entity_id));
    }

    fn has_readers(&self) -> bool {
        !self.readers.lock().is_empty()
    }

    fn describe(&self, sample: &mut RegistrationSample) {
        sample.tcp_port = self.port;
    }

    fn shutdown(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.command(WriterCommand::Shutdown);
        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        log::debug!("[TCP] publisher {} writer stopped", self.publisher_id);
    }
}

impl Drop for TcpWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Session {
    stream: TcpStream,
    remote_addr: SocketAddr,
    codec: FrameCodec,
    subscriber: Option<u64>,
    queue: VecDeque<Arc<[u8]>>,
    offset: usize,
    dropped: u64,
}

struct IoLoop {
    publisher_id: u64,
    poll: Poll,
    listener: TcpListener,
    sessions: HashMap<Token, Session>,
    next_token: usize,
    cmd_rx: Receiver<WriterCommand>,
    readers: Arc<Mutex<HashSet<u64>>>,
    running: Arc<AtomicBool>,
}

impl IoLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::debug!("[TCP] poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() {
                            self.handle_readable(token);
                        }
                        if event.is_writable() {
                            self.try_flush(token);
                        }
                    }
                }
            }
        }

        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            self.close_session(token, "writer shutdown");
        }
        self.running.store(false, Ordering::Release);
    }

    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        log::debug!("[TCP] failed to register session {}: {}", remote_addr, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    self.sessions.insert(
                        token,
                        Session {
                            stream,
                            remote_addr,
                            codec: FrameCodec::new(HELLO_MAX_FRAME),
                            subscriber: None,
                            queue: VecDeque::new(),
                            offset: 0,
                            dropped: 0,
                        },
                    );
                    log::debug!("[TCP] accepted session from {}", remote_addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("[TCP] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(WriterCommand::Broadcast(frame)) => self.broadcast(&frame),
                Ok(WriterCommand::Close(subscriber)) => {
                    let token = self
                        .sessions
                        .iter()
                        .find(|(_, s)| s.subscriber == Some(subscriber))
                        .map(|(t, _)| *t);
                    if let Some(token) = token {
                        self.close_session(token, "subscriber disconnected");
                    }
                }
                Ok(WriterCommand::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.running.store(false, Ordering::Release);
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    fn broadcast(&mut self, frame: &Arc<[u8]>) {
        let mut ready = Vec::new();
        for (token, session) in &mut self.sessions {
            if session.subscriber.is_none() {
                continue;
            }
            if session.queue.len() >= TCP_SESSION_QUEUE_DEPTH {
                session.dropped += 1;
                log::debug!(
                    "[TCP] session {} queue full, frame dropped ({} total)",
                    session.remote_addr,
                    session.dropped
                );
                continue;
            }
            session.queue.push_back(Arc::clone(frame));
            ready.push(*token);
        }
        for token in ready {
            self.try_flush(token);
        }
    }

    fn handle_readable(&mut self, token: Token) {
        let publisher_id = self.publisher_id;
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        loop {
            match session.codec.decode(&mut session.stream) {
                Ok(Some(body)) => {
                    if session.subscriber.is_some() {
                        continue;
                    }
                    match Hello::decode(&body) {
                        Ok(hello) if hello.publisher_id == publisher_id => {
                            session.subscriber = Some(hello.subscriber_id);
                            self.readers.lock().insert(hello.subscriber_id);
                            log::debug!(
                                "[TCP] subscriber {} attached from {}",
                                hello.subscriber_id,
                                session.remote_addr
                            );
                        }
                        Ok(_) => {
                            self.close_session(token, "hello for another publisher");
                            return;
                        }
                        Err(e) => {
                            let reason = format!("bad hello: {e}");
                            self.close_session(token, &reason);
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let reason = e.to_string();
                    self.close_session(token, &reason);
                    return;
                }
            }
        }
    }

    fn try_flush(&mut self, token: Token) {
        let Some(session) = self.sessions.get_mut(&token) else {
            return;
        };
        while let Some(front) = session.queue.front() {
            match session.stream.write(&front[session.offset..]) {
                Ok(0) => {
                    self.close_session(token, "write returned zero");
                    return;
                }
                Ok(n) => {
                    session.offset += n;
                    if session.offset == front.len() {
                        session.queue.pop_front();
                        session.offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let reason = format!("write error: {e}");
                    self.close_session(token, &reason);
                    return;
                }
            }
        }
    }

    fn close_session(&mut self, token: Token, reason: &str) {
        if let Some(mut session) = self.sessions.remove(&token) {
            let _ = self.poll.registry().deregister(&mut session.stream);
            if let Some(subscriber) = session.subscriber {
                self.readers.lock().remove(&subscriber);
            }
            log::debug!(
                "[TCP] session {} closed: {}",
                session.remote_addr,
                reason
            );
        }
    }
}
