// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # meshbus - brokerless publish/subscribe and services
//!
//! Publishers and subscribers find each other through a registration
//! layer and exchange samples over shared memory, UDP and TCP at the
//! same time. Subscribers deliver each logical send exactly once, no
//! matter how many layers carried it.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshbus::callback::ReceiveData;
//! use meshbus::config::{Config, PublisherConfig, SubscriberConfig};
//! use meshbus::entity::{DataTypeInformation, TopicId};
//! use meshbus::{Context, Publisher, Subscriber};
//!
//! fn main() -> meshbus::Result<()> {
//!     let ctx = Context::new("hello", Config::default())?;
//!     ctx.initialize()?;
//!
//!     let dti = DataTypeInformation::new("std::string", "utf-8");
//!     let subscriber = Subscriber::new(&ctx, "greetings", dti.clone(), SubscriberConfig::default())?;
//!     subscriber.set_receive_callback(
//!         |_: &TopicId, _: &DataTypeInformation, data: &ReceiveData<'_>| {
//!             println!("{}", String::from_utf8_lossy(data.buffer));
//!         },
//!     );
//!
//!     let publisher = Publisher::new(&ctx, "greetings", dti, PublisherConfig::default())?;
//!     publisher.send(b"hello", -1);
//!
//!     ctx.finalize();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                         Application Layer                           |
//! |  Publisher / Subscriber (+ typed)  |  ServiceServer / ServiceClient |
//! +---------------------------------------------------------------------+
//! |                          Context Runtime                            |
//! |  Registration provider/receiver | Directory (expiry) | Gateway      |
//! +---------------------------------------------------------------------+
//! |                         Transport Layers                            |
//! |     SHM memfiles (+ ack)  |  UDP multicast/broadcast  |  TCP        |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`context`] - initialize/finalize and directory queries (start here)
//! - [`pubsub`] - publishers, subscribers, cross-layer dedup
//! - [`service`] - request/response RPC
//! - [`registration`] - discovery samples and the directory
//! - [`transport`] - SHM, UDP and TCP layers
//! - [`config`] - defaults and per-entity options
//! - [`serializer`] / [`measurement`] - contracts for codec and storage backends

pub mod callback;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod measurement;
pub mod process;
pub mod pubsub;
pub mod registration;
pub mod serializer;
pub mod service;
pub mod transport;
pub mod wire;

pub use context::{Context, FinalizeState, InitState};
pub use entity::{DataTypeInformation, EntityId, ServiceId, TopicId};
pub use error::{Error, Result};
pub use pubsub::{Publisher, Subscriber, TypedPublisher, TypedSubscriber};
pub use service::{ServiceClient, ServiceServer};
