// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares exchanges, queues and bindings together with their retry twins.
//! For exchange `E`, queue `Q`, routing key `K` and interval `I` the builder
//! produces:
//!
//! - exchanges `E` and `E.retry` of the same kind
//! - queue `Q`, dead-lettering to `E.retry` with key `K.retry`
//! - queue `Q.retry`, holding messages for `I` ms before dead-lettering them
//!   back to `E` with key `K`
//! - bindings `Q <- E` on `K` and `Q.retry <- E.retry` on `K.retry`
//!
//! Rejecting a message on `Q` without requeue therefore redelivers it to `Q`
//! after `I` ms. With an empty `K` no dead-letter routing key is set and both
//! bindings use the empty key, so messages keep their original routing key.
//!
//! Every operation stops at the first failing declaration. Whatever was
//! declared before the failure stays on the broker.

use crate::{
    channel::Channel,
    errors::AmqpError,
    exchange::{retry_exchange_name, ExchangeDefinition, ExchangeKind},
    queue::{
        retry_queue_name, retry_routing_key, QueueBinding, QueueDefinition, QueueHandle,
        QueueKind,
    },
};
use async_trait::async_trait;
use tracing::debug;

/// Declaration of the retry-capable topology on a channel.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares the durable exchange `name` and its `name.retry` twin.
    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError>;

    /// Declares `queue` and `queue.retry` wired through dead-lettering.
    /// Returns the primary queue.
    async fn declare_queue(
        &self,
        queue: &str,
        kind: &QueueKind,
        exchange: &str,
        route_key: &str,
        interval_ms: u32,
    ) -> Result<QueueHandle, AmqpError>;

    /// Binds `queue` to `exchange` and its retry queue to the retry exchange.
    async fn bind_queue(
        &self,
        queue: &QueueHandle,
        route_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError>;

    /// Declares and binds a queue pair on an existing exchange pair.
    async fn new_queue(
        &self,
        exchange: &str,
        queue: &str,
        kind: &QueueKind,
        route_key: &str,
        interval_ms: u32,
    ) -> Result<QueueHandle, AmqpError> {
        let handle = self
            .declare_queue(queue, kind, exchange, route_key, interval_ms)
            .await?;
        self.bind_queue(&handle, route_key, exchange).await?;
        Ok(handle)
    }
}

impl Channel {
    async fn install_exchange(&self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name());
        self.current().exchange_declare(&def).await?;
        debug!("exchange: {} was created", def.name());
        Ok(())
    }

    async fn install_queue(&self, def: QueueDefinition) -> Result<QueueHandle, AmqpError> {
        debug!("creating queue: {}", def.name());
        let queue = self.current().queue_declare(&def).await?;
        debug!("queue: {} was created", def.name());
        Ok(queue)
    }

    async fn install_binding(&self, binding: QueueBinding) -> Result<(), AmqpError> {
        debug!(
            queue = binding.queue_name(),
            exchange = binding.exchange_name(),
            routing_key = binding.key(),
            "binding queue"
        );
        self.current().queue_bind(&binding).await
    }
}

#[async_trait]
impl Topology for Channel {
    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind) -> Result<(), AmqpError> {
        self.ensure_open()?;

        self.install_exchange(ExchangeDefinition::new(name).kind(kind).durable())
            .await?;
        self.install_exchange(
            ExchangeDefinition::new(&retry_exchange_name(name))
                .kind(kind)
                .durable(),
        )
        .await
    }

    async fn declare_queue(
        &self,
        queue: &str,
        kind: &QueueKind,
        exchange: &str,
        route_key: &str,
        interval_ms: u32,
    ) -> Result<QueueHandle, AmqpError> {
        self.ensure_open()?;

        let primary = self
            .install_queue(
                QueueDefinition::new(queue)
                    .durable()
                    .kind(kind)
                    .dead_letter_exchange(&retry_exchange_name(exchange))
                    .dead_letter_routing_key(&retry_routing_key(route_key)),
            )
            .await?;

        self.install_queue(
            QueueDefinition::new(&retry_queue_name(queue))
                .durable()
                .kind(kind)
                .dead_letter_exchange(exchange)
                .dead_letter_routing_key(route_key)
                .ttl(interval_ms),
        )
        .await?;

        Ok(primary)
    }

    async fn bind_queue(
        &self,
        queue: &QueueHandle,
        route_key: &str,
        exchange: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        self.install_binding(
            QueueBinding::new(queue.name())
                .exchange(exchange)
                .routing_key(route_key),
        )
        .await?;

        self.install_binding(
            QueueBinding::new(&retry_queue_name(queue.name()))
                .exchange(&retry_exchange_name(exchange))
                .routing_key(&retry_routing_key(route_key)),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{MockChannelHandle, MockConnectionHandle},
        channel::tests::{channel_over, idle_channel},
        queue::{
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
            AMQP_HEADERS_MESSAGE_TTL, AMQP_HEADERS_QUEUE_TYPE,
        },
    };
    use lapin::types::{AMQPValue, LongLongInt, LongString};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorded {
        exchanges: Vec<ExchangeDefinition>,
        queues: Vec<QueueDefinition>,
        bindings: Vec<QueueBinding>,
    }

    fn recording(handle: &mut MockChannelHandle) -> Arc<Mutex<Recorded>> {
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let r = recorded.clone();
        handle.expect_exchange_declare().returning(move |def| {
            r.lock().unwrap().exchanges.push(def.clone());
            Ok(())
        });
        let r = recorded.clone();
        handle.expect_queue_declare().returning(move |def| {
            r.lock().unwrap().queues.push(def.clone());
            Ok(QueueHandle::new(def.name(), 0, 0))
        });
        let r = recorded.clone();
        handle.expect_queue_bind().returning(move |binding| {
            r.lock().unwrap().bindings.push(binding.clone());
            Ok(())
        });

        recorded
    }

    fn text(value: &str) -> Option<AMQPValue> {
        Some(AMQPValue::LongString(LongString::from(value)))
    }

    #[tokio::test(start_paused = true)]
    async fn builds_the_orders_retry_cycle() {
        let (mut handle, _close_tx) = idle_channel();
        let recorded = recording(&mut handle);
        let channel = channel_over(handle, MockConnectionHandle::new());

        channel
            .declare_exchange("orders", &ExchangeKind::Direct)
            .await
            .unwrap();
        let queue = channel
            .new_queue("orders", "orders_created", &QueueKind::Quorum, "orders.created", 5000)
            .await
            .unwrap();

        assert_eq!(queue.name(), "orders_created");

        let recorded = recorded.lock().unwrap();

        let exchanges: Vec<_> = recorded.exchanges.iter().map(|e| e.name()).collect();
        assert_eq!(exchanges, vec!["orders", "orders.retry"]);
        assert!(recorded
            .exchanges
            .iter()
            .all(|e| e.is_durable() && *e.exchange_kind() == ExchangeKind::Direct));

        let primary = &recorded.queues[0];
        assert_eq!(primary.name(), "orders_created");
        assert!(primary.is_durable());
        assert_eq!(primary.arg(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).cloned(), text("orders.retry"));
        assert_eq!(
            primary.arg(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).cloned(),
            text("orders.created.retry")
        );
        assert_eq!(primary.arg(AMQP_HEADERS_QUEUE_TYPE).cloned(), text("quorum"));
        assert!(primary.arg(AMQP_HEADERS_MESSAGE_TTL).is_none());

        let retry = &recorded.queues[1];
        assert_eq!(retry.name(), "orders_created.retry");
        assert_eq!(retry.arg(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).cloned(), text("orders"));
        assert_eq!(
            retry.arg(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).cloned(),
            text("orders.created")
        );
        assert_eq!(
            retry.arg(AMQP_HEADERS_MESSAGE_TTL).cloned(),
            Some(AMQPValue::LongLongInt(LongLongInt::from(5000)))
        );
        assert_eq!(retry.arg(AMQP_HEADERS_QUEUE_TYPE).cloned(), text("quorum"));

        let bindings: Vec<_> = recorded
            .bindings
            .iter()
            .map(|b| (b.queue_name(), b.exchange_name(), b.key()))
            .collect();
        assert_eq!(
            bindings,
            vec![
                ("orders_created", "orders", "orders.created"),
                ("orders_created.retry", "orders.retry", "orders.created.retry"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_route_key_keeps_the_original_key() {
        let (mut handle, _close_tx) = idle_channel();
        let recorded = recording(&mut handle);
        let channel = channel_over(handle, MockConnectionHandle::new());

        channel
            .new_queue("events", "audit", &QueueKind::Classic, "", 1000)
            .await
            .unwrap();

        let recorded = recorded.lock().unwrap();
        assert!(recorded
            .queues
            .iter()
            .all(|q| q.arg(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY).is_none()));
        assert_eq!(
            recorded.queues[0].arg(AMQP_HEADERS_DEAD_LETTER_EXCHANGE).cloned(),
            text("events.retry")
        );

        let bindings: Vec<_> = recorded
            .bindings
            .iter()
            .map(|b| (b.queue_name(), b.exchange_name(), b.key()))
            .collect();
        assert_eq!(
            bindings,
            vec![("audit", "events", ""), ("audit.retry", "events.retry", "")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_the_first_failure() {
        let (mut handle, _close_tx) = idle_channel();
        handle
            .expect_queue_declare()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name().to_owned())));
        handle.expect_queue_bind().never();
        let channel = channel_over(handle, MockConnectionHandle::new());

        let result = channel
            .new_queue("orders", "orders_created", &QueueKind::Classic, "orders.created", 5000)
            .await;

        assert_eq!(
            result,
            Err(AmqpError::DeclareQueueError("orders_created".to_owned()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exchange_is_skipped_when_the_primary_fails() {
        let (mut handle, _close_tx) = idle_channel();
        handle
            .expect_exchange_declare()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name().to_owned())));
        let channel = channel_over(handle, MockConnectionHandle::new());

        assert_eq!(
            channel.declare_exchange("orders", &ExchangeKind::Topic).await,
            Err(AmqpError::DeclareExchangeError("orders".to_owned()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channel_declares_nothing() {
        let (mut handle, _close_tx) = idle_channel();
        handle.expect_exchange_declare().never();
        let channel = channel_over(handle, MockConnectionHandle::new());
        channel.close().await.unwrap();

        assert_eq!(
            channel.declare_exchange("orders", &ExchangeKind::Direct).await,
            Err(AmqpError::ChannelClosed)
        );
    }
}
