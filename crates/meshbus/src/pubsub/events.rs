// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

use crate::entity::{DataTypeInformation, TopicId};

/// Publisher-side match events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherEvent {
    Connected {
        subscriber: TopicId,
        data_type: DataTypeInformation,
    },
    Disconnected {
        subscriber: TopicId,
    },
    /// The subscriber reported `count` more lost samples since its last
    /// registration.
    Dropped { subscriber: TopicId, count: u64 },
}

/// Subscriber-side match events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Connected {
        publisher: TopicId,
        data_type: DataTypeInformation,
    },
    Disconnected {
        publisher: TopicId,
    },
    /// A gap of `missed` clocks was detected before the last delivered sample.
    Dropped { publisher: TopicId, missed: u64 },
}
