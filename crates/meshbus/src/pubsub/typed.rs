// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed façades over [`Publisher`] and [`Subscriber`].

use super::events::{PublisherEvent, SubscriberEvent};
use super::payload::PayloadWriter;
use super::publisher::Publisher;
use super::subscriber::Subscriber;
use crate::callback::{EventCallback, ReceiveData};
use crate::config::{PublisherConfig, SubscriberConfig};
use crate::context::Context;
use crate::entity::{DataTypeInformation, TopicId};
use crate::error::Result;
use crate::serializer::MessageSerializer;
use std::sync::Arc;

/// Adapts one message to the payload writer seam.
struct SerializedPayload<'a, S: MessageSerializer> {
    serializer: &'a S,
    message: &'a S::Message,
    size: usize,
}

impl<S: MessageSerializer> PayloadWriter for SerializedPayload<'_, S> {
    fn write_full(&mut self, buf: &mut [u8]) -> bool {
        self.serializer.serialize(self.message, buf)
    }

    fn size(&self) -> usize {
        self.size
    }
}

pub struct TypedPublisher<S: MessageSerializer> {
    publisher: Publisher,
    serializer: S,
}

impl<S: MessageSerializer> TypedPublisher<S> {
    pub fn new(ctx: &Context, topic_name: &str, serializer: S, config: PublisherConfig) -> Result<Self> {
        let publisher = Publisher::new(ctx, topic_name, serializer.data_type_information(), config)?;
        Ok(Self {
            publisher,
            serializer,
        })
    }

    /// Serialize and send. With no subscriber the message is not
    /// serialized, but the send clock still advances.
    pub fn send(&self, message: &S::Message, time: i64) -> bool {
        let mut payload = SerializedPayload {
            serializer: &self.serializer,
            message,
            size: self.serializer.message_size(message),
        };
        self.publisher.send_with(&mut payload, time)
    }

    pub fn set_event_callback<C: EventCallback<PublisherEvent>>(&self, callback: C) -> bool {
        self.publisher.set_event_callback(callback)
    }

    pub fn remove_event_callback(&self) -> bool {
        self.publisher.remove_event_callback()
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    pub fn raw(&self) -> &Publisher {
        &self.publisher
    }
}

pub struct TypedSubscriber<S: MessageSerializer> {
    subscriber: Subscriber,
    serializer: Arc<S>,
}

impl<S: MessageSerializer> TypedSubscriber<S> {
    pub fn new(
        ctx: &Context,
        topic_name: &str,
        serializer: S,
        config: SubscriberConfig,
    ) -> Result<Self> {
        let subscriber =
            Subscriber::new(ctx, topic_name, serializer.data_type_information(), config)?;
        Ok(Self {
            subscriber,
            serializer: Arc::new(serializer),
        })
    }

    /// Install a callback receiving decoded messages. Payloads the
    /// serializer rejects are dropped with a debug log.
    pub fn set_receive_callback<F>(&self, callback: F) -> bool
    where
        F: Fn(&TopicId, S::Message, &ReceiveData<'_>) + Send + Sync + 'static,
    {
        let serializer = Arc::clone(&self.serializer);
        self.subscriber.set_receive_callback(
            move |publisher: &TopicId, data_type: &DataTypeInformation, data: &ReceiveData<'_>| {
                match serializer.deserialize(data.buffer, data_type) {
                    Some(message) => callback(publisher, message, data),
                    None => log::debug!(
                        "[SUB] '{}': payload of {} bytes not decodable as '{}'",
                        publisher.topic_name,
                        data.buffer.len(),
                        data_type.name
                    ),
                }
            },
        )
    }

    pub fn remove_receive_callback(&self) -> bool {
        self.subscriber.remove_receive_callback()
    }

    /// Polling receive; undecodable samples are skipped.
    pub fn receive(&self, timeout_ms: i64) -> Option<(TopicId, S::Message)> {
        let message = self.subscriber.receive(timeout_ms)?;
        let data_type = self.subscriber.data_type_information();
        self.serializer
            .deserialize(&message.payload, data_type)
            .map(|decoded| (message.publisher, decoded))
    }

    pub fn set_event_callback<C: EventCallback<SubscriberEvent>>(&self, callback: C) -> bool {
        self.subscriber.set_event_callback(callback)
    }

    pub fn remove_event_callback(&self) -> bool {
        self.subscriber.remove_event_callback()
    }

    pub fn publisher_count(&self) -> usize {
        self.subscriber.publisher_count()
    }

    pub fn raw(&self) -> &Subscriber {
        &self.subscriber
    }
}
