// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP layer: best-effort datagrams, fragmented above
//! `UDP_FRAGMENT_PAYLOAD` bytes.
//!
//! A context keeps one data receiver bound on the data port; every
//! arriving envelope is routed to local subscribers by topic name.

pub mod fragment;
pub mod multicast;
mod receiver;
mod sender;
mod writer;

pub use multicast::{bind_receiver, data_destination, join_group, open_sender, topic_group};
pub use receiver::{MessageHandler, UdpReceiver};
pub use sender::UdpSender;
pub use writer::UdpWriter;
