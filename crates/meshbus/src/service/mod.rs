// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response services over TCP.
//!
//! A [`ServiceServer`] advertises its port and methods through the
//! registration layer; a [`ServiceClient`] connects to every server
//! instance of the same service name it discovers.
//!
//! Three calling conventions are offered per [`ClientInstance`]:
//!
//! | Call                        | Blocks | Result delivered          |
//! |-----------------------------|--------|---------------------------|
//! | `call_with_response`        | yes    | return value              |
//! | `call_with_callback`        | yes    | callback, before return   |
//! | `call_with_callback_async`  | no     | callback, reader thread   |
//!
//! # Example
//!
//! ```no_run
//! use meshbus::config::Config;
//! use meshbus::context::Context;
//! use meshbus::service::{ServiceClient, ServiceMethodInformation, ServiceServer};
//!
//! let ctx = Context::new("calc", Config::default()).expect("config");
//! ctx.initialize().expect("init");
//!
//! let server = ServiceServer::new(&ctx, "calc").expect("server");
//! server.set_method_callback(
//!     ServiceMethodInformation::new("neg"),
//!     |_: &ServiceMethodInformation, req: &[u8]| (0, req.iter().map(|b| !b).collect()),
//! );
//!
//! let client = ServiceClient::new(&ctx, "calc", Vec::new()).expect("client");
//! let _responses = client.call_with_response("neg", &[1, 2, 3], 500);
//! ```

mod client;
mod error;
mod protocol;
mod server;
mod types;

pub use client::{ClientInstance, ServiceClient};
pub use error::{CallErrorKind, ServiceError, ServiceResult};
pub use server::ServiceServer;
pub use types::{CallState, ClientEvent, ServerEvent, ServiceMethodInformation, ServiceResponse};
