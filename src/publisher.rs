// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishing goes through the channel's current handle, so it keeps working
//! after the channel was recreated. Messages are persistent, carry a fresh
//! UUID as `message_id` and the current OpenTelemetry context in their
//! headers. A failed publish is logged and returned; it is never retried.

use crate::{channel::Channel, errors::AmqpError, otel, queue::QueueHandle};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

fn message_properties(content_type: &str) -> BasicProperties {
    let mut headers = BTreeMap::new();
    otel::inject(&Context::current(), &mut headers);

    BasicProperties::default()
        .with_content_type(ShortString::from(content_type))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(FieldTable::from(headers))
}

impl Channel {
    /// Publishes `body` to `exchange`.
    ///
    /// The routing key is the queue name when `queue` is given, `routing_key`
    /// otherwise.
    pub async fn publish_message(
        &self,
        queue: Option<&QueueHandle>,
        routing_key: &str,
        content_type: &str,
        exchange: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let routing_key = queue.map(|q| q.name()).unwrap_or(routing_key);

        self.current()
            .basic_publish(exchange, routing_key, body, message_properties(content_type))
            .await
            .inspect_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                )
            })
    }

    /// Serializes `payload` as JSON and publishes it.
    pub async fn publish_json<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + Sync,
    {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), exchange, routing_key, "failure to serialize payload");
            AmqpError::PublishingError(err.to_string())
        })?;

        self.publish_message(None, routing_key, JSON_CONTENT_TYPE, exchange, &body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockChannelHandle, MockConnectionHandle},
        channel::tests::{channel_over, idle_channel},
    };
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Published {
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        properties: BasicProperties,
    }

    fn capturing(handle: &mut MockChannelHandle) -> Arc<Mutex<Vec<Published>>> {
        let published = Arc::new(Mutex::new(vec![]));
        let sink = published.clone();
        handle
            .expect_basic_publish()
            .returning(move |exchange, routing_key, body, properties| {
                sink.lock().unwrap().push(Published {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    body: body.to_vec(),
                    properties,
                });
                Ok(())
            });
        published
    }

    #[tokio::test(start_paused = true)]
    async fn queue_name_wins_over_the_routing_key() {
        let (mut handle, _close_tx) = idle_channel();
        let published = capturing(&mut handle);
        let channel = channel_over(handle, MockConnectionHandle::new());
        let queue = QueueHandle::new("orders_created", 0, 0);

        channel
            .publish_message(Some(&queue), "ignored", "text/plain", "orders", b"hello")
            .await
            .unwrap();
        channel
            .publish_message(None, "orders.created", "text/plain", "orders", b"world")
            .await
            .unwrap();

        let published = published.lock().unwrap();
        assert_eq!(published[0].routing_key, "orders_created");
        assert_eq!(published[0].body, b"hello");
        assert_eq!(published[1].routing_key, "orders.created");
        assert!(published.iter().all(|p| p.exchange == "orders"));
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_persistent_with_unique_ids() {
        let (mut handle, _close_tx) = idle_channel();
        let published = capturing(&mut handle);
        let channel = channel_over(handle, MockConnectionHandle::new());

        for _ in 0..2 {
            channel
                .publish_message(None, "k", "text/plain", "orders", b"x")
                .await
                .unwrap();
        }

        let published = published.lock().unwrap();
        for p in published.iter() {
            assert_eq!(*p.properties.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
            assert_eq!(
                p.properties.content_type().as_ref().map(|c| c.as_str()),
                Some("text/plain")
            );
            assert!(p.properties.headers().is_some());
        }
        assert_ne!(
            published[0].properties.message_id(),
            published[1].properties.message_id()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn publish_json_sets_the_content_type() {
        #[derive(Serialize)]
        struct OrderCreated {
            id: u32,
        }

        let (mut handle, _close_tx) = idle_channel();
        let published = capturing(&mut handle);
        let channel = channel_over(handle, MockConnectionHandle::new());

        channel
            .publish_json("orders", "orders.created", &OrderCreated { id: 7 })
            .await
            .unwrap();

        let published = published.lock().unwrap();
        assert_eq!(published[0].body, br#"{"id":7}"#);
        assert_eq!(
            published[0].properties.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_returned_without_retry() {
        let (mut handle, _close_tx) = idle_channel();
        handle
            .expect_basic_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::PublishingError("channel closed".to_owned())));
        let channel = channel_over(handle, MockConnectionHandle::new());

        assert_eq!(
            channel
                .publish_message(None, "k", JSON_CONTENT_TYPE, "orders", b"{}")
                .await,
            Err(AmqpError::PublishingError("channel closed".to_owned()))
        );
    }
}
