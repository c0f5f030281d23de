// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Explicit lifecycle object.
//!
//! A [`Context`] owns the registration machinery and the shared sockets.
//! It is reference counted: `initialize` may be called several times and
//! only the matching last `finalize` tears everything down. Every entity
//! is constructed against a context instead of a hidden process global.
//!
//! # Example
//!
//! ```no_run
//! use meshbus::config::Config;
//! use meshbus::context::{Context, FinalizeState, InitState};
//!
//! let ctx = Context::new("sensor_node", Config::default()).expect("valid config");
//! assert_eq!(ctx.initialize().expect("init"), InitState::Initialized);
//! assert_eq!(ctx.initialize().expect("init"), InitState::AlreadyInitialized(2));
//! assert_eq!(ctx.finalize(), FinalizeState::StillInitialized(1));
//! assert_eq!(ctx.finalize(), FinalizeState::Finalized);
//! assert_eq!(ctx.finalize(), FinalizeState::NotInitialized);
//! ```

mod gateway;
mod runtime;

pub(crate) use gateway::LocalEntity;
pub(crate) use runtime::Runtime;

use crate::config::{Config, RuntimeConfig};
use crate::error::{Error, Result};
use crate::process::ProcessInfo;
use crate::registration::{ServiceInfo, TopicInfo};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Result of [`Context::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    /// This call started the runtime
    Initialized,
    /// Already running; carries the new reference count
    AlreadyInitialized(usize),
}

/// Result of [`Context::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeState {
    /// This call stopped the runtime
    Finalized,
    /// Still referenced; carries the remaining count
    StillInitialized(usize),
    /// Nothing to finalize (never initialized, or already finalized)
    NotInitialized,
}

#[derive(Default)]
struct Lifecycle {
    count: usize,
    runtime: Option<Arc<Runtime>>,
}

struct ContextInner {
    process: ProcessInfo,
    config: RuntimeConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.lifecycle.get_mut().runtime.take() {
            runtime.shutdown();
        }
    }
}

/// Handle to one middleware instance. Clone is an `Arc` increment.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    /// Validate `config` and build an uninitialized context.
    pub fn new(unit_name: &str, config: Config) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(ContextInner {
                process: ProcessInfo::current(unit_name),
                config: RuntimeConfig::new(config)?,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        })
    }

    /// Start the runtime on the first call, count the others.
    ///
    /// The configuration in effect at the first call is the one the
    /// runtime uses until it is finalized.
    pub fn initialize(&self) -> Result<InitState> {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.count > 0 {
            lifecycle.count += 1;
            return Ok(InitState::AlreadyInitialized(lifecycle.count));
        }
        let runtime = Runtime::start(&self.inner.process.unit_name, self.inner.config.snapshot())?;
        lifecycle.runtime = Some(runtime);
        lifecycle.count = 1;
        log::info!(
            "[CONTEXT] '{}' initialized (pid {} on {})",
            self.inner.process.unit_name,
            self.inner.process.process_id,
            self.inner.process.host_name
        );
        Ok(InitState::Initialized)
    }

    /// Drop one reference; the last one stops the runtime.
    ///
    /// Teardown unregisters every entity, wakes blocked service calls
    /// and joins the background threads before returning.
    pub fn finalize(&self) -> FinalizeState {
        let runtime = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match lifecycle.count {
                0 => return FinalizeState::NotInitialized,
                1 => {
                    lifecycle.count = 0;
                    lifecycle.runtime.take()
                }
                n => {
                    lifecycle.count = n - 1;
                    return FinalizeState::StillInitialized(n - 1);
                }
            }
        };
        if let Some(runtime) = runtime {
            runtime.shutdown();
        }
        log::info!("[CONTEXT] '{}' finalized", self.inner.process.unit_name);
        FinalizeState::Finalized
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lifecycle.lock().count > 0
    }

    /// Runtime configuration store. Changes apply to the next
    /// initialization and to entities constructed afterwards.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn process_info(&self) -> &ProcessInfo {
        &self.inner.process
    }

    /// Publishers and subscribers currently in the directory.
    pub fn topics(&self) -> Vec<TopicInfo> {
        self.runtime().map(|rt| rt.topics()).unwrap_or_default()
    }

    pub fn topic_names(&self) -> BTreeSet<String> {
        self.runtime().map(|rt| rt.topic_names()).unwrap_or_default()
    }

    /// Service servers currently in the directory.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.runtime().map(|rt| rt.services()).unwrap_or_default()
    }

    /// Service clients currently in the directory.
    pub fn clients(&self) -> Vec<ServiceInfo> {
        self.runtime().map(|rt| rt.clients()).unwrap_or_default()
    }

    pub(crate) fn runtime(&self) -> Result<Arc<Runtime>> {
        self.inner
            .lifecycle
            .lock()
            .runtime
            .clone()
            .ok_or(Error::NotInitialized)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("unit_name", &self.inner.process.unit_name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        let mut cfg = Config::default();
        cfg.registration.udp_enable = false;
        cfg.registration.refresh_ms = 50;
        cfg.registration.timeout_ms = 500;
        cfg
    }

    #[test]
    fn test_refcounted_lifecycle() {
        let ctx = Context::new("ctx_unit", quiet_config()).expect("Failed to create context");
        assert!(!ctx.is_initialized());
        assert!(matches!(ctx.runtime(), Err(Error::NotInitialized)));

        assert_eq!(
            ctx.initialize().expect("Failed to initialize"),
            InitState::Initialized
        );
        assert_eq!(
            ctx.initialize().expect("Failed to initialize"),
            InitState::AlreadyInitialized(2)
        );
        assert!(ctx.is_initialized());

        assert_eq!(ctx.finalize(), FinalizeState::StillInitialized(1));
        assert!(ctx.is_initialized());
        assert_eq!(ctx.finalize(), FinalizeState::Finalized);
        assert!(!ctx.is_initialized());
        assert_eq!(ctx.finalize(), FinalizeState::NotInitialized);
        assert_eq!(ctx.finalize(), FinalizeState::NotInitialized);
    }

    #[test]
    fn test_reinitialize_after_finalize() {
        let ctx = Context::new("ctx_again", quiet_config()).expect("Failed to create context");
        ctx.initialize().expect("Failed to initialize");
        assert_eq!(ctx.finalize(), FinalizeState::Finalized);
        assert_eq!(
            ctx.initialize().expect("Failed to initialize"),
            InitState::Initialized
        );
        assert!(ctx.is_initialized());
        assert_eq!(ctx.finalize(), FinalizeState::Finalized);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = quiet_config();
        cfg.registration.timeout_ms = 10;
        assert!(matches!(
            Context::new("bad", cfg),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_silent_peer_expires_after_timeout() {
        use crate::entity::{DataTypeInformation, EntityId};
        use crate::registration::{EntityKind, RegistrationSample};
        use crate::transport::{Layer, LayerSet};
        use crate::Subscriber;
        use std::time::{Duration, Instant};

        let ctx = Context::new("ctx_expiry", quiet_config()).expect("Failed to create context");
        ctx.initialize().expect("Failed to initialize");
        let sub = Subscriber::with_defaults(&ctx, "ctx_ghost", DataTypeInformation::default())
            .expect("Failed to create subscriber");
        let ghost_listed = || {
            ctx.topics()
                .iter()
                .any(|t| t.kind == EntityKind::Publisher && t.topic_id.topic_name == "ctx_ghost")
        };

        // a remote publisher that registers once and never unregisters
        let mut ghost =
            RegistrationSample::new(EntityKind::Publisher, EntityId::generate(), "ctx_ghost");
        ghost.layers = LayerSet::from_layers(&[Layer::Udp]);
        let injected_at = Instant::now();
        ctx.runtime()
            .expect("Failed to get runtime")
            .apply_sample(ghost);
        assert!(ghost_listed());
        assert_eq!(sub.publisher_count(), 1);

        // still listed well inside timeout_ms
        std::thread::sleep(Duration::from_millis(300));
        assert!(ghost_listed());
        assert_eq!(sub.publisher_count(), 1);

        // gone within timeout_ms plus one refresh, with scheduling slack
        let deadline = injected_at + Duration::from_millis(500 + 50 + 500);
        while Instant::now() < deadline && sub.publisher_count() != 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        let elapsed = injected_at.elapsed();
        assert_eq!(sub.publisher_count(), 0, "not expired after {:?}", elapsed);
        assert!(elapsed >= Duration::from_millis(500), "expired after {:?}", elapsed);
        assert!(!ghost_listed());
        ctx.finalize();
    }

    #[test]
    fn test_queries_empty_when_not_initialized() {
        let ctx = Context::new("idle", quiet_config()).expect("Failed to create context");
        assert!(ctx.topics().is_empty());
        assert!(ctx.services().is_empty());
        assert!(ctx.clients().is_empty());
        assert_eq!(ctx.process_info().unit_name, "idle");
    }
}
