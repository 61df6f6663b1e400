// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # `lapin` Broker Handles
//!
//! Production implementations of the handles in [`crate::broker`]. Every call
//! logs the client error with `tracing` and maps it into [`AmqpError`].

use crate::{
    broker::{
        Acknowledger, ChannelHandle, CloseNotification, CloseReason, ConnectionHandle,
        ConsumeOptions, Dialer, RawDeliveries,
    },
    delivery::Delivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueBindOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

impl From<&lapin::Error> for CloseReason {
    fn from(err: &lapin::Error) -> Self {
        CloseReason::new(&err.to_string())
    }
}

/// Bridges a single-slot `on_error` callback into a [`CloseNotification`].
fn close_notifier() -> (impl FnMut(lapin::Error) + Send + 'static, CloseNotification) {
    let (tx, rx) = oneshot::channel();
    let mut slot = Some(tx);

    let handler = move |err: lapin::Error| {
        if let Some(tx) = slot.take() {
            let _ = tx.send(CloseReason::from(&err));
        }
    };

    (handler, rx)
}

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinDialer {
    connection_name: Option<String>,
}

impl LapinDialer {
    /// Creates a dialer with default `lapin` connection properties.
    pub fn new() -> Self {
        LapinDialer::default()
    }

    /// Name shown for the connection in the broker management UI.
    ///
    /// # Parameters
    /// * `name` - Sent as the `connection_name` client property
    ///
    /// # Returns
    /// The dialer, for chaining
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

#[async_trait]
impl Dialer for LapinDialer {
    async fn dial(&self, url: &str) -> Result<Box<dyn ConnectionHandle>, AmqpError> {
        let mut options = ConnectionProperties::default();
        if let Some(name) = &self.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        match lapin::Connection::connect(url, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Box::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// A live `lapin` connection.
///
/// Closure notifications come from `on_error`, so an orderly close by this
/// process is never reported.
pub struct LapinConnection {
    conn: lapin::Connection,
}

#[async_trait]
impl ConnectionHandle for LapinConnection {
    async fn create_channel(&self) -> Result<Box<dyn ChannelHandle>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(id = channel.id(), "channel created");
                Ok(Box::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn notify_close(&self) -> CloseNotification {
        let (handler, rx) = close_notifier();
        self.conn.on_error(handler);
        rx
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closed by application")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

/// A live `lapin` channel.
///
/// Each call maps the client error into the matching [`AmqpError`] variant.
pub struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl ChannelHandle for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    prefetch_count, "amqp channel qos setting failed"
                );
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                def.options(),
                def.arguments(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name().to_owned())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError> {
        self.channel
            .queue_declare(def.name(), def.options(), def.arguments())
            .await
            .map(QueueHandle::from)
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the queue"
                );
                AmqpError::DeclareQueueError(def.name().to_owned())
            })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                )
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer: &str,
        options: ConsumeOptions,
        args: FieldTable,
    ) -> Result<RawDeliveries, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.auto_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                args,
            )
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::from(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| AmqpError::PublishingError(err.to_string()))
    }

    fn notify_close(&self) -> CloseNotification {
        let (handler, rx) = close_notifier();
        self.channel.on_error(handler);
        rx
    }

    fn is_connected(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closed by application")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

/// Settles one delivery on the channel it arrived on.
struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions { multiple, requeue })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        Delivery::new(
            delivery.delivery_tag,
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
            delivery.redelivered,
            delivery.properties,
            delivery.data,
            Arc::new(LapinAcker {
                acker: delivery.acker,
            }),
        )
    }
}
