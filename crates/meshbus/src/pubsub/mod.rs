// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish/subscribe entities.

mod dedup;
mod events;
mod payload;
mod publisher;
mod subscriber;
mod typed;

pub use dedup::{DedupTable, DedupVerdict};
pub use events::{PublisherEvent, SubscriberEvent};
pub use payload::{BufferPayload, PayloadWriter};
pub use publisher::Publisher;
pub use subscriber::{ReceivedMessage, Subscriber};
pub use typed::{TypedPublisher, TypedSubscriber};
