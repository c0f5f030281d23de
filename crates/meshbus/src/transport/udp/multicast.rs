// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket setup and group addressing shared by the UDP data layer and the
//! registration channel.
//!
//! Local mode broadcasts on the loopback network (`127.255.255.255`), so
//! only processes on this host see the traffic. Network mode sends to a
//! multicast group derived from the topic name.

use crate::config::{UdpConfig, UdpMode};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

/// Poll interval of every receive loop.
pub const RECV_POLL: Duration = Duration::from_millis(100);

/// Bind a receive socket on `0.0.0.0:port` shared with other processes.
pub fn bind_receiver(port: u16, receive_buffer: usize) -> io::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket2.set_reuse_address(true)?;
    #[cfg(unix)]
    set_reuseport(&socket2)?;
    if let Err(e) = socket2.set_recv_buffer_size(receive_buffer) {
        log::debug!("[UDP] set_recv_buffer_size({}) failed: {}", receive_buffer, e);
    }
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket2.bind(&bind_addr.into())?;

    let socket: UdpSocket = socket2.into();
    socket.set_read_timeout(Some(RECV_POLL))?;
    log::debug!("[UDP] receiver bound to {}", bind_addr);
    Ok(socket)
}

/// Open an unbound-port send socket configured for `cfg.mode`.
pub fn open_sender(cfg: &UdpConfig) -> io::Result<UdpSocket> {
    let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket2.set_reuse_address(true)?;
    if let Err(e) = socket2.set_send_buffer_size(cfg.send_buffer) {
        log::debug!("[UDP] set_send_buffer_size({}) failed: {}", cfg.send_buffer, e);
    }
    match cfg.mode {
        UdpMode::Local => socket2.set_broadcast(true)?,
        UdpMode::Network => {
            socket2.set_multicast_ttl_v4(cfg.network_ttl)?;
            socket2.set_multicast_loop_v4(true)?;
        }
    }
    socket2.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    Ok(socket2.into())
}

/// Multicast group for a topic: the configured base address with the
/// host bits outside `mask` taken from the topic hash.
pub fn topic_group(cfg: &UdpConfig, topic_name: &str) -> Ipv4Addr {
    let base = u32::from(cfg.network_group);
    let mask = u32::from(cfg.mask);
    let spread = fnv1a(topic_name) & !mask;
    Ipv4Addr::from((base & mask) | spread)
}

/// Destination of data samples for `topic_name`.
pub fn data_destination(cfg: &UdpConfig, topic_name: &str) -> SocketAddr {
    let ip = match cfg.mode {
        UdpMode::Local => crate::config::UDP_LOCAL_BROADCAST,
        UdpMode::Network => topic_group(cfg, topic_name),
    };
    SocketAddr::new(IpAddr::V4(ip), cfg.port)
}

/// Join `group` on every non-loopback IPv4 interface.
pub fn join_group(socket: &UdpSocket, group: Ipv4Addr) -> io::Result<()> {
    let interfaces = multicast_interfaces();
    if interfaces.is_empty() {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        log::debug!("[UDP] join_multicast_v4({}) on UNSPECIFIED", group);
    } else {
        for iface in &interfaces {
            match socket.join_multicast_v4(&group, iface) {
                Ok(()) => {
                    log::debug!("[UDP] join_multicast_v4({}) on interface {}", group, iface);
                }
                Err(e) if e.raw_os_error() == Some(98) => {
                    // EADDRINUSE: already joined on the same NIC
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} - already joined, skipping",
                        group,
                        iface
                    );
                }
                Err(e) => {
                    log::debug!(
                        "[UDP] join_multicast_v4({}) on {} failed (non-fatal): {}",
                        group,
                        iface,
                        e
                    );
                }
            }
        }
    }
    socket.set_multicast_loop_v4(true)?;
    Ok(())
}

fn multicast_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[UDP] Failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };
    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect()
}

fn fnv1a(s: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(unix)]
fn set_reuseport(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with valid fd, standard socket option, and correctly sized optval pointer
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
