// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration channel over UDP.

use super::sample::RegistrationSample;
use crate::config::{RegistrationConfig, UdpConfig, UdpMode, UDP_LOCAL_BROADCAST};
use crate::transport::udp::{self, UdpReceiver};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Callback for every decoded sample from another process.
pub type SampleHandler = Arc<dyn Fn(RegistrationSample) + Send + Sync>;

/// Where registration samples are sent.
pub fn registration_destination(reg: &RegistrationConfig, udp_cfg: &UdpConfig) -> SocketAddr {
    let ip = match udp_cfg.mode {
        UdpMode::Local => UDP_LOCAL_BROADCAST,
        UdpMode::Network => udp_cfg.network_group,
    };
    SocketAddr::new(IpAddr::V4(ip), reg.udp_port)
}

/// Listens on the registration port and forwards samples of other
/// processes. Samples from this process are applied by loopback instead.
pub struct RegistrationReceiver {
    receiver: UdpReceiver,
}

impl RegistrationReceiver {
    pub fn start(
        reg: &RegistrationConfig,
        udp_cfg: &UdpConfig,
        handler: SampleHandler,
    ) -> io::Result<Self> {
        let socket = udp::bind_receiver(reg.udp_port, udp_cfg.receive_buffer)?;
        if udp_cfg.mode == UdpMode::Network {
            udp::join_group(&socket, udp_cfg.network_group)?;
        }
        let receiver = UdpReceiver::start(
            "meshbus-reg-recv",
            socket,
            Arc::new(move |message: &[u8]| match RegistrationSample::decode(message) {
                Ok(sample) if sample.entity.is_local_process() => {}
                Ok(sample) => handler(sample),
                Err(e) => log::debug!("[REG] dropping malformed registration sample: {}", e),
            }),
        )?;
        log::debug!("[REG] registration receiver on port {}", reg.udp_port);
        Ok(Self { receiver })
    }

    pub fn stop(self) {
        self.receiver.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_follows_mode() {
        let reg = RegistrationConfig::default();
        let mut udp_cfg = UdpConfig::default();
        assert_eq!(
            registration_destination(&reg, &udp_cfg),
            SocketAddr::new(IpAddr::V4(UDP_LOCAL_BROADCAST), reg.udp_port)
        );
        udp_cfg.mode = UdpMode::Network;
        assert_eq!(
            registration_destination(&reg, &udp_cfg).ip(),
            IpAddr::V4(udp_cfg.network_group)
        );
    }
}
