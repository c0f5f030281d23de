// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use super::multicast;
use super::sender::UdpSender;
use crate::config::UdpConfig;
use crate::entity::EntityId;
use crate::registration::RegistrationSample;
use crate::transport::{Envelope, Layer, LayerWriter, WriteContext};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

/// Publisher side of the UDP layer. One send per sample reaches every
/// subscriber listening on the destination.
pub struct UdpWriter {
    sender: Arc<UdpSender>,
    dest: SocketAddr,
    readers: Mutex<HashSet<u64>>,
}

impl UdpWriter {
    pub fn new(sender: Arc<UdpSender>, cfg: &UdpConfig, topic_name: &str) -> Self {
        let dest = multicast::data_destination(cfg, topic_name);
        log::debug!("[UDP] writer for '{}' -> {}", topic_name, dest);
        Self {
            sender,
            dest,
            readers: Mutex::new(HashSet::new()),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.dest
    }
}

impl LayerWriter for UdpWriter {
    fn layer(&self) -> Layer {
        Layer::Udp
    }

    fn write(&self, ctx: &WriteContext<'_>, payload: &[u8]) -> bool {
        let message = Envelope::encode(&ctx.header(), payload);
        match self.sender.send(&message, self.dest) {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "[UDP] send of '{}' clock {} to {} failed: {}",
                    ctx.topic_name,
                    ctx.send_clock,
                    self.dest,
                    e
                );
                false
            }
        }
    }

    fn connect(&self, subscriber: &RegistrationSample) {
        self.readers.lock().insert(subscriber.entity.entity_id);
    }

    fn disconnect(&self, subscriber_id: &EntityId) {
        self.readers.lock().remove(&subscriber_id.entity_id);
    }

    fn has_readers(&self) -> bool {
        !self.readers.lock().is_empty()
    }

    fn describe(&self, _sample: &mut RegistrationSample) {}
}
