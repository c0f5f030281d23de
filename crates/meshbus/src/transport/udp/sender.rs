// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::fragment;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

/// Fragmenting datagram sender.
pub struct UdpSender {
    socket: UdpSocket,
    sender_id: u64,
    next_message: AtomicU64,
}

impl UdpSender {
    pub fn new(socket: UdpSocket, sender_id: u64) -> Self {
        Self {
            socket,
            sender_id,
            next_message: AtomicU64::new(1),
        }
    }

    /// Send one message, split over as many datagrams as needed.
    pub fn send(&self, message: &[u8], dest: SocketAddr) -> io::Result<usize> {
        let message_id = self.next_message.fetch_add(1, Ordering::Relaxed);
        let mut sent = 0;
        for datagram in fragment::split(self.sender_id, message_id, message) {
            sent += self.socket.send_to(&datagram, dest)?;
        }
        Ok(sent)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
