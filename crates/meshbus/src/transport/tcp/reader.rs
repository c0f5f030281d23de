// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Subscriber side of the TCP layer: one connection per matched
//! publisher, re-established up to `max_reconnections` times in a row.

use super::frame_codec::FrameCodec;
use super::Hello;
use crate::config::TCP_MAX_FRAME_SIZE;
use crate::entity::EntityId;
use crate::transport::{Envelope, Layer, SampleSink};
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_POLL: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpReader {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TcpReader {
    pub fn start(
        subscriber_id: u64,
        publisher: EntityId,
        port: u16,
        max_reconnections: u32,
        sink: Arc<dyn SampleSink>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("meshbus-tcp-sub".to_string())
            .spawn(move || {
                let session = ReaderSession {
                    subscriber_id,
                    publisher,
                    port,
                    max_reconnections,
                };
                session.run(&stop_clone, sink.as_ref());
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TcpReader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct ReaderSession {
    subscriber_id: u64,
    publisher: EntityId,
    port: u16,
    max_reconnections: u32,
}

impl ReaderSession {
    fn run(&self, stop: &AtomicBool, sink: &dyn SampleSink) {
        let mut failures = 0u32;
        while !stop.load(Ordering::Acquire) {
            match self.connect() {
                Ok(stream) => {
                    failures = 0;
                    log::debug!(
                        "[TCP] connected to publisher {} on port {}",
                        self.publisher,
                        self.port
                    );
                    if let Err(e) = self.read_stream(stream, stop, sink) {
                        log::debug!("[TCP] session with {} ended: {}", self.publisher, e);
                    }
                }
                Err(e) => {
                    log::debug!(
                        "[TCP] connect to publisher {} port {} failed: {}",
                        self.publisher,
                        self.port,
                        e
                    );
                }
            }
            if stop.load(Ordering::Acquire) {
                break;
            }
            failures += 1;
            if failures > self.max_reconnections {
                log::warn!(
                    "[TCP] giving up on publisher {} after {} attempts",
                    self.publisher,
                    failures
                );
                break;
            }
            thread::sleep(RECONNECT_BACKOFF);
        }
    }

    fn target(&self) -> io::Result<SocketAddr> {
        if self.publisher.is_local_host() {
            return Ok(SocketAddr::from(([127, 0, 0, 1], self.port)));
        }
        (self.publisher.host_name.as_str(), self.port)
            .to_socket_addrs()?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no IPv4 address for host '{}'", self.publisher.host_name),
                )
            })
    }

    fn connect(&self) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect_timeout(&self.target()?, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        let hello = Hello {
            subscriber_id: self.subscriber_id,
            publisher_id: self.publisher.entity_id,
        };
        FrameCodec::write_frame(&mut stream, &hello.encode())?;
        stream.set_read_timeout(Some(READ_POLL))?;
        Ok(stream)
    }

    fn read_stream(
        &self,
        mut stream: TcpStream,
        stop: &AtomicBool,
        sink: &dyn SampleSink,
    ) -> io::Result<()> {
        let mut codec = FrameCodec::new(TCP_MAX_FRAME_SIZE);
        while !stop.load(Ordering::Acquire) {
            let Some(body) = codec.decode(&mut stream)? else {
                continue;
            };
            match Envelope::decode(&body) {
                Ok(env) => sink.apply_sample(Layer::Tcp, &env.header, &env.payload),
                Err(e) => log::debug!("[TCP] dropping malformed sample frame: {}", e),
            }
        }
        Ok(())
    }
}
