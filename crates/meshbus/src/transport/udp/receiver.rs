// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Background receive loop: reads datagrams, reassembles fragments and
//! hands complete messages to a handler.

use super::fragment::{FragmentHeader, Reassembler};
use super::multicast;
use crate::config::UDP_MAX_DATAGRAM;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Complete-message callback.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl UdpReceiver {
    /// Spawn the receive thread on an already bound socket.
    pub fn start(name: &str, socket: UdpSocket, handler: MessageHandler) -> io::Result<Self> {
        let socket = Arc::new(socket);
        let stop = Arc::new(AtomicBool::new(false));

        let socket_clone = Arc::clone(&socket);
        let stop_clone = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || receive_loop(&socket_clone, &stop_clone, handler.as_ref()))?;

        Ok(Self {
            socket,
            stop,
            handle: Some(handle),
        })
    }

    pub fn join_group(&self, group: Ipv4Addr) -> io::Result<()> {
        multicast::join_group(&self.socket, group)
    }

    pub fn local_port(&self) -> io::Result<u16> {
        Ok(self.socket.local_addr()?.port())
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

impl Drop for UdpReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(socket: &UdpSocket, stop: &AtomicBool, handler: &(dyn Fn(&[u8]) + Send + Sync)) {
    let mut buf = vec![0u8; UDP_MAX_DATAGRAM];
    let mut reassembler = Reassembler::default();

    while !stop.load(Ordering::Acquire) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _src)) => len,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                log::debug!("[UDP] recv_from failed: {}", e);
                continue;
            }
        };

        let (header, chunk) = match FragmentHeader::parse(&buf[..len]) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("[UDP] dropping malformed datagram ({} bytes): {}", len, e);
                continue;
            }
        };
        if let Some(message) = reassembler.push(header, chunk) {
            handler(&message);
        }
    }
    log::debug!("[UDP] receive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::sender::UdpSender;
    use parking_lot::Mutex;
    use std::net::{SocketAddr, SocketAddrV4};
    use std::time::{Duration, Instant};

    #[test]
    fn test_receive_fragmented_message() {
        let socket = multicast::bind_receiver(0, 1 << 20).expect("Failed to bind receiver");
        let port = socket.local_addr().expect("Failed to get addr").port();
        let got: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let got_clone = Arc::clone(&got);
        let receiver = UdpReceiver::start(
            "meshbus-udp-test",
            socket,
            Arc::new(move |m: &[u8]| got_clone.lock().push(m.to_vec())),
        )
        .expect("Failed to start receiver");

        let out = UdpSocket::bind("127.0.0.1:0").expect("Failed to bind sender");
        let sender = UdpSender::new(out, 42);
        let dest = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        let big: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
        sender.send(b"small", dest).expect("Failed to send");
        sender.send(&big, dest).expect("Failed to send");

        let deadline = Instant::now() + Duration::from_secs(2);
        while got.lock().len() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let got = got.lock();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], b"small");
        assert_eq!(got[1], big);
        drop(got);
        receiver.stop();
    }
}
