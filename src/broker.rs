// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Handles
//!
//! The supervised [`Connection`](crate::connection::Connection) and
//! [`Channel`](crate::channel::Channel) never talk to the client library
//! directly. They hold the handles defined here, which the `lapin` backed
//! implementations in [`crate::lapin_broker`] provide in production. A handle
//! is a single, non-recovering broker object: once it reports a closure the
//! supervisor throws it away and installs a fresh one.

use crate::{
    delivery::Delivery,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueHandle},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{types::FieldTable, BasicProperties};
use std::fmt;
use tokio::sync::oneshot;

#[cfg(test)]
use mockall::automock;

/// Raw deliveries of a single `basic.consume`; ends when the channel closes or
/// the consumer is cancelled by the broker.
pub type RawDeliveries = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Resolves with the reason of a broker-initiated closure.
///
/// The sender side is dropped without a value when the handle goes away
/// without an error, which supervisors treat as a closure they must not repair.
pub type CloseNotification = oneshot::Receiver<CloseReason>;

/// Why the broker or the network closed a connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: Option<u16>,
    pub reason: String,
}

impl CloseReason {
    pub fn new(reason: &str) -> Self {
        CloseReason {
            code: None,
            reason: reason.to_owned(),
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({})", self.reason, code),
            None => f.write_str(&self.reason),
        }
    }
}

/// Consume flags of `basic.consume`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// Opens broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    /// One connection attempt, no retry.
    async fn dial(&self, url: &str) -> Result<Box<dyn ConnectionHandle>, AmqpError>;
}

/// A single broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn create_channel(&self) -> Result<Box<dyn ChannelHandle>, AmqpError>;

    /// Registers for the next broker-initiated closure of this connection.
    fn notify_close(&self) -> CloseNotification;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A single logical channel multiplexed over a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Per-channel prefetch limit, no size limit.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<QueueHandle, AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer: &str,
        options: ConsumeOptions,
        args: FieldTable,
    ) -> Result<RawDeliveries, AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Registers for the next broker-initiated closure of this channel.
    fn notify_close(&self) -> CloseNotification;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery on the channel it arrived on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}
