// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Deliveries
//!
//! A [`Delivery`] is one message handed to the application. It must be settled
//! exactly once, which the API enforces by consuming the delivery in
//! [`Delivery::ack`] and [`Delivery::nack`]. Rejecting with `requeue = false`
//! on a queue built by the topology builder dead-letters the message into its
//! retry queue; it comes back after the retry TTL.
//!
//! [`Deliveries`] is the stable stream returned by
//! [`Channel::consume`](crate::channel::Channel::consume). It outlives channel
//! recreation and only ends after the channel is closed.

use crate::{broker::Acknowledger, errors::AmqpError, otel};
use futures_util::Stream;
use lapin::{protocol::basic::AMQPProperties, types::AMQPValue};
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{self, Poll},
};
use tokio::sync::mpsc;
use tracing::error;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// A message received from the broker.
pub struct Delivery {
    delivery_tag: u64,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    properties: AMQPProperties,
    body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub(crate) fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: AMQPProperties,
        body: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            body,
            acker,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Set by the broker when the message was delivered before and not settled.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type().as_ref().map(|ct| ct.as_str())
    }

    pub fn properties(&self) -> &AMQPProperties {
        &self.properties
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Number of times the message went through a dead-letter cycle, read
    /// from the first `x-death` entry.
    pub fn retry_count(&self) -> i64 {
        let Some(headers) = self.properties.headers() else {
            return 0;
        };

        headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(AMQPValue::as_array)
            .and_then(|deaths| deaths.as_slice().first())
            .and_then(AMQPValue::as_field_table)
            .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
            .and_then(AMQPValue::as_long_long_int)
            .unwrap_or_default()
    }

    /// Decodes the body as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.body).map_err(|err| {
            error!(
                error = err.to_string(),
                message_id = self.message_id(),
                "failure to parse payload"
            );
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    /// Trace context propagated by the publisher.
    pub fn trace_context(&self) -> Context {
        otel::extract(self.properties.headers().as_ref())
    }

    /// Acknowledges the message.
    pub async fn ack(self, multiple: bool) -> Result<(), AmqpError> {
        self.acker.ack(multiple).await
    }

    /// Rejects the message. With `requeue = false` a queue carrying a dead
    /// letter exchange routes it to its retry queue.
    pub async fn nack(self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(multiple, requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id())
            .field("body_size", &self.body.len())
            .finish()
    }
}

/// Stable stream of deliveries fed by the delivery pump.
#[derive(Debug)]
pub struct Deliveries {
    rx: mpsc::Receiver<Delivery>,
}

impl Deliveries {
    pub(crate) fn new(rx: mpsc::Receiver<Delivery>) -> Self {
        Deliveries { rx }
    }

    /// Waits for the next delivery. `None` once the channel was closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Stream for Deliveries {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Option<Delivery>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::broker::MockAcknowledger;
    use lapin::{
        types::{FieldArray, FieldTable, LongLongInt, ShortString},
        BasicProperties,
    };
    use std::collections::BTreeMap;

    pub(crate) fn delivery(tag: u64, routing_key: &str, body: &str) -> Delivery {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().returning(|_| Ok(()));
        acker.expect_nack().returning(|_, _| Ok(()));

        Delivery::new(
            tag,
            "orders",
            routing_key,
            false,
            BasicProperties::default().with_message_id(ShortString::from(format!("msg-{tag}"))),
            body.as_bytes().to_vec(),
            Arc::new(acker),
        )
    }

    #[test]
    fn exposes_message_fields() {
        let d = delivery(7, "orders.created", "{}");

        assert_eq!(d.delivery_tag(), 7);
        assert_eq!(d.message_id(), Some("msg-7"));
        assert_eq!(d.routing_key(), "orders.created");
        assert_eq!(d.exchange(), "orders");
        assert_eq!(d.body(), b"{}");
        assert!(!d.redelivered());
    }

    #[test]
    fn retry_count_reads_first_x_death_entry() {
        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(2)),
        );
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );

        let d = Delivery::new(
            1,
            "orders.retry",
            "orders.created.retry",
            false,
            BasicProperties::default().with_headers(FieldTable::from(headers)),
            vec![],
            Arc::new(MockAcknowledger::new()),
        );

        assert_eq!(d.retry_count(), 2);
        assert!(d.properties().headers().is_some());
        assert_eq!(delivery(1, "k", "").retry_count(), 0);
    }

    #[test]
    fn parse_json_reports_bad_payloads() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Order {
            id: u32,
        }

        assert_eq!(
            delivery(1, "k", r#"{"id":4}"#).parse_json::<Order>(),
            Ok(Order { id: 4 })
        );
        assert!(matches!(
            delivery(1, "k", "not json").parse_json::<Order>(),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }

    #[tokio::test]
    async fn ack_and_nack_reach_the_acknowledger() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().withf(|multiple| !*multiple).times(1).returning(|_| Ok(()));
        acker
            .expect_nack()
            .withf(|multiple, requeue| !*multiple && *requeue)
            .times(1)
            .returning(|_, _| Err(AmqpError::NackMessageError));
        let acker: Arc<dyn Acknowledger> = Arc::new(acker);

        let first = Delivery::new(1, "", "k", false, BasicProperties::default(), vec![], acker.clone());
        let second = Delivery::new(2, "", "k", false, BasicProperties::default(), vec![], acker);

        assert_eq!(first.ack(false).await, Ok(()));
        assert_eq!(second.nack(false, true).await, Err(AmqpError::NackMessageError));
    }

    #[tokio::test]
    async fn deliveries_end_when_the_sender_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        let mut deliveries = Deliveries::new(rx);

        tx.send(delivery(1, "k", "a")).await.unwrap();
        drop(tx);

        assert_eq!(deliveries.recv().await.map(|d| d.delivery_tag()), Some(1));
        assert!(deliveries.recv().await.is_none());
    }
}
