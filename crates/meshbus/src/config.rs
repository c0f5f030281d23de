// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Configuration: compile-time defaults, typed config tree, runtime store.
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: `pub const` defaults below
//! - **Level 2 (Typed)**: [`Config`] tree with `Default` impls, validated
//!   once when a context is built
//! - **Level 3 (Dynamic)**: [`RuntimeConfig`], the per-context store.
//!   `ArcSwap` holds the active snapshot, a `DashMap` keeps the raw string
//!   overrides that produced it
//!
//! Publishers and subscribers copy a [`PublisherConfig`] / [`SubscriberConfig`]
//! snapshot at construction; later changes to the context do not affect
//! entities that already exist.
//!
//! # Example
//!
//! ```
//! use meshbus::config::{Config, RuntimeConfig};
//!
//! let config = RuntimeConfig::new(Config::default()).expect("valid defaults");
//! config.set("registration.refresh_ms", "100").expect("valid override");
//! assert_eq!(config.snapshot().registration.refresh_ms, 100);
//! ```

use crate::error::{Error, Result};
use crate::transport::{Layer, LayerSet};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

// =======================================================================
// Registration
// =======================================================================

/// Period of the registration provider timer.
pub const REGISTRATION_REFRESH_MS: u64 = 1_000;

/// Entries not refreshed within this window are expired.
pub const REGISTRATION_TIMEOUT_MS: u64 = 60_000;

/// UDP port for registration datagrams.
pub const REGISTRATION_UDP_PORT: u16 = 14_000;

// =======================================================================
// UDP layer
// =======================================================================

pub const UDP_DATA_PORT: u16 = 14_002;

/// Loopback broadcast address used in local mode.
pub const UDP_LOCAL_BROADCAST: Ipv4Addr = Ipv4Addr::new(127, 255, 255, 255);

pub const UDP_NETWORK_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

pub const UDP_NETWORK_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 240);

pub const UDP_NETWORK_TTL: u32 = 3;

/// Socket send/receive buffer size (5 MiB).
pub const UDP_SOCKET_BUFFER: usize = 5 * 1024 * 1024;

/// Payload bytes per UDP fragment.
pub const UDP_FRAGMENT_PAYLOAD: usize = 60_000;

/// Maximum datagram size accepted by receivers.
pub const UDP_MAX_DATAGRAM: usize = 65_536;

/// Partial messages tracked by a reassembler.
pub const FRAGMENT_BUFFER_SIZE: usize = 256;

/// Incomplete messages older than this are dropped.
pub const FRAGMENT_TIMEOUT_MS: u64 = 500;

// =======================================================================
// TCP layer
// =======================================================================

pub const TCP_MAX_RECONNECTIONS: u32 = 5;

pub const TCP_EXECUTOR_READER: usize = 4;

pub const TCP_EXECUTOR_WRITER: usize = 4;

/// Frames queued per TCP session before new frames are dropped.
pub const TCP_SESSION_QUEUE_DEPTH: usize = 128;

/// Largest TCP frame accepted (64 MiB).
pub const TCP_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

// =======================================================================
// SHM layer
// =======================================================================

pub const SHM_MEMFILE_MIN_SIZE: usize = 4 * 1024;

/// Extra room reserved when a memfile grows, in percent.
pub const SHM_MEMFILE_RESERVE_PERCENT: u32 = 50;

/// Bounded wait for the memfile write lock.
pub const SHM_WRITE_LOCK_TIMEOUT_MS: u64 = 50;

/// Bounded wait for the memfile read lock.
pub const SHM_READ_LOCK_TIMEOUT_MS: u64 = 50;

/// Observer wait slice on the notify futex.
pub const SHM_OBSERVER_SLICE_MS: u64 = 20;

// =======================================================================
// Subscriber
// =======================================================================

/// Samples kept for polling `receive` when no callback is installed.
pub const RECEIVE_QUEUE_DEPTH: usize = 64;

/// Clocks behind the newest one that dedup still remembers.
pub const DEDUP_WINDOW: u64 = 64;

/// Sentinel meaning "use current time" / "wait forever".
pub const DEFAULT_TIME_ARGUMENT: i64 = -1;

// =======================================================================
// Typed configuration tree
// =======================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConfig {
    pub refresh_ms: u64,
    pub timeout_ms: u64,
    /// Apply this context's own registrations to its directory.
    pub loopback: bool,
    pub udp_enable: bool,
    pub udp_port: u16,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            refresh_ms: REGISTRATION_REFRESH_MS,
            timeout_ms: REGISTRATION_TIMEOUT_MS,
            loopback: true,
            udp_enable: true,
            udp_port: REGISTRATION_UDP_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UdpMode {
    /// Loopback broadcast, host only
    #[default]
    Local,
    /// Per-topic multicast groups
    Network,
}

impl FromStr for UdpMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(UdpMode::Local),
            "network" => Ok(UdpMode::Network),
            other => Err(Error::InvalidConfig(format!("unknown udp mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConfig {
    pub mode: UdpMode,
    pub port: u16,
    pub network_group: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub network_ttl: u32,
    pub send_buffer: usize,
    pub receive_buffer: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            mode: UdpMode::Local,
            port: UDP_DATA_PORT,
            network_group: UDP_NETWORK_GROUP,
            mask: UDP_NETWORK_MASK,
            network_ttl: UDP_NETWORK_TTL,
            send_buffer: UDP_SOCKET_BUFFER,
            receive_buffer: UDP_SOCKET_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    pub max_reconnections: u32,
    pub number_executor_reader: usize,
    pub number_executor_writer: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_reconnections: TCP_MAX_RECONNECTIONS,
            number_executor_reader: TCP_EXECUTOR_READER,
            number_executor_writer: TCP_EXECUTOR_WRITER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmConfig {
    pub memfile_min_size_bytes: usize,
    pub memfile_reserve_percent: u32,
}

impl Default for ShmConfig {
    fn default() -> Self {
        Self {
            memfile_min_size_bytes: SHM_MEMFILE_MIN_SIZE,
            memfile_reserve_percent: SHM_MEMFILE_RESERVE_PERCENT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportLayerConfig {
    pub udp: UdpConfig,
    pub tcp: TcpConfig,
    pub shm: ShmConfig,
}

/// Per-publisher options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub shm_enable: bool,
    pub shm_zero_copy_mode: bool,
    pub shm_acknowledge_timeout_ms: u64,
    pub shm_memfile_buffer_count: usize,
    pub udp_enable: bool,
    pub tcp_enable: bool,
    /// Requested topic name -> effective topic name
    pub topic_renaming: BTreeMap<String, String>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            shm_enable: true,
            shm_zero_copy_mode: false,
            shm_acknowledge_timeout_ms: 0,
            shm_memfile_buffer_count: 1,
            udp_enable: true,
            tcp_enable: true,
            topic_renaming: BTreeMap::new(),
        }
    }
}

impl PublisherConfig {
    /// Apply one option by key.
    ///
    /// Recognized keys: `layer.shm.enable`, `layer.udp.enable`,
    /// `layer.tcp.enable`, `layer.shm.zero_copy_mode`,
    /// `layer.shm.memfile_buffer_count`, `layer.shm.acknowledge_timeout_ms`,
    /// `topic_renaming` (`old:new`).
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "layer.shm.enable" => self.shm_enable = parse_bool(key, value)?,
            "layer.udp.enable" => self.udp_enable = parse_bool(key, value)?,
            "layer.tcp.enable" => self.tcp_enable = parse_bool(key, value)?,
            "layer.shm.zero_copy_mode" => self.shm_zero_copy_mode = parse_bool(key, value)?,
            "layer.shm.memfile_buffer_count" => {
                let count: usize = parse_num(key, value)?;
                if count == 0 {
                    return Err(Error::InvalidConfig(
                        "layer.shm.memfile_buffer_count must be >= 1".to_string(),
                    ));
                }
                self.shm_memfile_buffer_count = count;
            }
            "layer.shm.acknowledge_timeout_ms" => {
                self.shm_acknowledge_timeout_ms = parse_num(key, value)?
            }
            "topic_renaming" => {
                let (from, to) = parse_renaming(value)?;
                self.topic_renaming.insert(from, to);
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Result<Self> {
        self.set_option(key, value)?;
        Ok(self)
    }

    pub fn layers(&self) -> LayerSet {
        layer_set(self.shm_enable, self.udp_enable, self.tcp_enable)
    }

    pub fn effective_topic_name<'a>(&'a self, requested: &'a str) -> &'a str {
        self.topic_renaming
            .get(requested)
            .map_or(requested, String::as_str)
    }
}

/// Per-subscriber options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub shm_enable: bool,
    pub udp_enable: bool,
    pub tcp_enable: bool,
    /// Discard late samples instead of delivering them with a warning.
    pub drop_out_of_order_messages: bool,
    pub topic_renaming: BTreeMap<String, String>,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            shm_enable: true,
            udp_enable: true,
            tcp_enable: false,
            drop_out_of_order_messages: true,
            topic_renaming: BTreeMap::new(),
        }
    }
}

impl SubscriberConfig {
    /// Apply one option by key (`layer.*.enable`,
    /// `drop_out_of_order_messages`, `topic_renaming`).
    pub fn set_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "layer.shm.enable" => self.shm_enable = parse_bool(key, value)?,
            "layer.udp.enable" => self.udp_enable = parse_bool(key, value)?,
            "layer.tcp.enable" => self.tcp_enable = parse_bool(key, value)?,
            "drop_out_of_order_messages" => {
                self.drop_out_of_order_messages = parse_bool(key, value)?
            }
            "topic_renaming" => {
                let (from, to) = parse_renaming(value)?;
                self.topic_renaming.insert(from, to);
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }

    pub fn with_option(mut self, key: &str, value: &str) -> Result<Self> {
        self.set_option(key, value)?;
        Ok(self)
    }

    pub fn layers(&self) -> LayerSet {
        layer_set(self.shm_enable, self.udp_enable, self.tcp_enable)
    }

    pub fn effective_topic_name<'a>(&'a self, requested: &'a str) -> &'a str {
        self.topic_renaming
            .get(requested)
            .map_or(requested, String::as_str)
    }
}

/// Full configuration of one context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub registration: RegistrationConfig,
    pub transport_layer: TransportLayerConfig,
    pub publisher: PublisherConfig,
    pub subscriber: SubscriberConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let reg = &self.registration;
        if reg.refresh_ms == 0 {
            return Err(Error::InvalidConfig(
                "registration.refresh_ms must be > 0".to_string(),
            ));
        }
        if reg.timeout_ms <= reg.refresh_ms {
            return Err(Error::InvalidConfig(format!(
                "registration.timeout_ms ({}) must exceed registration.refresh_ms ({})",
                reg.timeout_ms, reg.refresh_ms
            )));
        }
        if self.publisher.shm_memfile_buffer_count == 0 {
            return Err(Error::InvalidConfig(
                "publisher.layer.shm.memfile_buffer_count must be >= 1".to_string(),
            ));
        }
        if self.transport_layer.shm.memfile_min_size_bytes == 0 {
            return Err(Error::InvalidConfig(
                "transport_layer.shm.memfile_min_size_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply one dotted override. `publisher.*` and `subscriber.*` keys
    /// are forwarded to the entity config `set_option`.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(rest) = key.strip_prefix("publisher.") {
            return self.publisher.set_option(rest, value);
        }
        if let Some(rest) = key.strip_prefix("subscriber.") {
            return self.subscriber.set_option(rest, value);
        }
        let reg = &mut self.registration;
        let tl = &mut self.transport_layer;
        match key {
            "registration.refresh_ms" => reg.refresh_ms = parse_num(key, value)?,
            "registration.timeout_ms" => reg.timeout_ms = parse_num(key, value)?,
            "registration.loopback" => reg.loopback = parse_bool(key, value)?,
            "registration.udp.enable" => reg.udp_enable = parse_bool(key, value)?,
            "registration.udp.port" => reg.udp_port = parse_num(key, value)?,
            "transport_layer.udp.mode" => tl.udp.mode = value.parse()?,
            "transport_layer.udp.port" => tl.udp.port = parse_num(key, value)?,
            "transport_layer.udp.network_group" => tl.udp.network_group = parse_num(key, value)?,
            "transport_layer.udp.mask" => tl.udp.mask = parse_num(key, value)?,
            "transport_layer.udp.network_ttl" => tl.udp.network_ttl = parse_num(key, value)?,
            "transport_layer.udp.send_buffer" => tl.udp.send_buffer = parse_num(key, value)?,
            "transport_layer.udp.receive_buffer" => tl.udp.receive_buffer = parse_num(key, value)?,
            "transport_layer.tcp.max_reconnections" => {
                tl.tcp.max_reconnections = parse_num(key, value)?
            }
            "transport_layer.tcp.number_executor_reader" => {
                tl.tcp.number_executor_reader = parse_num(key, value)?
            }
            "transport_layer.tcp.number_executor_writer" => {
                tl.tcp.number_executor_writer = parse_num(key, value)?
            }
            "transport_layer.shm.memfile_min_size_bytes" => {
                tl.shm.memfile_min_size_bytes = parse_num(key, value)?
            }
            "transport_layer.shm.memfile_reserve_percent" => {
                tl.shm.memfile_reserve_percent = parse_num(key, value)?
            }
            _ => return Err(unknown_key(key)),
        }
        Ok(())
    }
}

// =======================================================================
// Runtime Configuration (Dynamic, Lock-Free)
// =======================================================================

/// Shared runtime configuration of one context.
///
/// Clone is an `Arc` increment. Readers take a snapshot with an atomic
/// load and never block writers.
#[derive(Clone)]
pub struct RuntimeConfig {
    /// Active validated configuration
    active: Arc<ArcSwap<Config>>,

    /// Raw string overrides applied so far (dotted key -> value)
    overrides: Arc<DashMap<Arc<str>, Arc<str>>>,
}

impl RuntimeConfig {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            active: Arc::new(ArcSwap::from_pointee(config)),
            overrides: Arc::new(DashMap::new()),
        })
    }

    /// Current configuration snapshot.
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Arc<Config> {
        self.active.load_full()
    }

    /// Apply one override. The new snapshot is validated as a whole and
    /// the previous one stays active when validation fails.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut next = Config::clone(&self.active.load());
        next.set(key, value)?;
        next.validate()?;
        self.active.store(Arc::new(next));
        self.overrides.insert(Arc::from(key), Arc::from(value));
        log::debug!("[CONTEXT] config override {}={}", key, value);
        Ok(())
    }

    /// Raw override value, if one was set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<str>> {
        self.overrides.get(key).map(|v| Arc::clone(v.value()))
    }

    /// All overrides whose key starts with `prefix`.
    #[must_use]
    pub fn search_prefix(&self, prefix: &str) -> Vec<(Arc<str>, Arc<str>)> {
        let mut out: Vec<_> = self
            .overrides
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (Arc::clone(e.key()), Arc::clone(e.value())))
            .collect();
        out.sort();
        out
    }
}

// =======================================================================
// Parsing helpers
// =======================================================================

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" => Ok(false),
        _ => Err(Error::InvalidConfig(format!(
            "{}: expected boolean, got '{}'",
            key, value
        ))),
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{}: cannot parse '{}'", key, value)))
}

fn parse_renaming(value: &str) -> Result<(String, String)> {
    match value.split_once(':') {
        Some((from, to)) if !from.is_empty() && !to.is_empty() => {
            Ok((from.to_string(), to.to_string()))
        }
        _ => Err(Error::InvalidConfig(format!(
            "topic_renaming: expected 'old:new', got '{}'",
            value
        ))),
    }
}

fn unknown_key(key: &str) -> Error {
    Error::InvalidConfig(format!("unknown option '{}'", key))
}

fn layer_set(shm: bool, udp: bool, tcp: bool) -> LayerSet {
    let mut set = LayerSet::empty();
    if shm {
        set.insert(Layer::Shm);
    }
    if udp {
        set.insert(Layer::Udp);
    }
    if tcp {
        set.insert(Layer::Tcp);
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.registration.refresh_ms, 1000);
        assert_eq!(cfg.registration.timeout_ms, 60_000);
        assert_eq!(cfg.transport_layer.udp.port, 14_002);
        assert_eq!(cfg.transport_layer.shm.memfile_reserve_percent, 50);
        assert!(cfg.publisher.layers().contains(Layer::Tcp));
        assert!(!cfg.subscriber.layers().contains(Layer::Tcp));
        assert!(cfg.subscriber.drop_out_of_order_messages);
    }

    #[test]
    fn test_timeout_must_exceed_refresh() {
        let mut cfg = Config::default();
        cfg.registration.timeout_ms = cfg.registration.refresh_ms;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_publisher_set_option() {
        let cfg = PublisherConfig::default()
            .with_option("layer.udp.enable", "false")
            .expect("Failed to set udp")
            .with_option("layer.shm.acknowledge_timeout_ms", "500")
            .expect("Failed to set ack")
            .with_option("layer.shm.memfile_buffer_count", "3")
            .expect("Failed to set buffer count")
            .with_option("topic_renaming", "raw:cooked")
            .expect("Failed to set renaming");
        assert!(!cfg.udp_enable);
        assert_eq!(cfg.shm_acknowledge_timeout_ms, 500);
        assert_eq!(cfg.shm_memfile_buffer_count, 3);
        assert_eq!(cfg.effective_topic_name("raw"), "cooked");
        assert_eq!(cfg.effective_topic_name("other"), "other");
    }

    #[test]
    fn test_set_option_rejects_bad_values() {
        let mut cfg = PublisherConfig::default();
        assert!(cfg.set_option("layer.shm.enable", "maybe").is_err());
        assert!(cfg.set_option("layer.shm.memfile_buffer_count", "0").is_err());
        assert!(cfg.set_option("topic_renaming", "nocolon").is_err());
        assert!(cfg.set_option("layer.quic.enable", "true").is_err());
        assert_eq!(cfg, PublisherConfig::default());
    }

    #[test]
    fn test_runtime_config_override_and_rollback() {
        let rc = RuntimeConfig::new(Config::default()).expect("Failed to create config");
        rc.set("registration.refresh_ms", "100")
            .expect("Failed to set refresh");
        rc.set("subscriber.layer.tcp.enable", "on")
            .expect("Failed to set subscriber tcp");
        assert_eq!(rc.snapshot().registration.refresh_ms, 100);
        assert!(rc.snapshot().subscriber.tcp_enable);

        // timeout below refresh is rejected and the old snapshot stays
        assert!(rc.set("registration.timeout_ms", "50").is_err());
        assert_eq!(rc.snapshot().registration.timeout_ms, 60_000);

        assert_eq!(rc.get("registration.refresh_ms").as_deref(), Some("100"));
        assert_eq!(rc.search_prefix("subscriber.").len(), 1);
    }

    #[test]
    fn test_udp_mode_and_addresses() {
        let mut cfg = Config::default();
        cfg.set("transport_layer.udp.mode", "Network")
            .expect("Failed to set mode");
        cfg.set("transport_layer.udp.network_group", "239.5.0.1")
            .expect("Failed to set group");
        assert_eq!(cfg.transport_layer.udp.mode, UdpMode::Network);
        assert_eq!(
            cfg.transport_layer.udp.network_group,
            Ipv4Addr::new(239, 5, 0, 1)
        );
        assert!(cfg.set("transport_layer.udp.mode", "mesh").is_err());
    }
}
