// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for declaring queues and bindings. A queue built by the topology
//! builder always comes with a `<queue>.retry` twin: rejected messages are
//! dead-lettered into the retry queue, which holds them for a fixed TTL and
//! then dead-letters them back to the primary exchange.

use crate::exchange::RETRY_SUFFIX;
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use std::{collections::BTreeMap, fmt};

/// Queue argument naming the exchange that receives dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument for message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument selecting the queue implementation (classic, quorum, stream)
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";

/// Returns the name of the retry queue paired with `queue`.
pub fn retry_queue_name(queue: &str) -> String {
    format!("{queue}{RETRY_SUFFIX}")
}

/// Returns the routing key of the retry path. An empty key stays empty.
pub fn retry_routing_key(routing_key: &str) -> String {
    if routing_key.is_empty() {
        return String::new();
    }

    format!("{routing_key}{RETRY_SUFFIX}")
}

/// Queue implementation requested through `x-queue-type`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum QueueKind {
    #[default]
    Classic,
    Quorum,
    Stream,
    Custom(String),
}

impl QueueKind {
    pub fn as_str(&self) -> &str {
        match self {
            QueueKind::Classic => "classic",
            QueueKind::Quorum => "quorum",
            QueueKind::Stream => "stream",
            QueueKind::Custom(kind) => kind,
        }
    }
}

impl From<&str> for QueueKind {
    fn from(value: &str) -> Self {
        match value {
            "classic" => QueueKind::Classic,
            "quorum" => QueueKind::Quorum,
            "stream" => QueueKind::Stream,
            other => QueueKind::Custom(other.to_owned()),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// Arguments are kept in a sorted map so a definition renders the same
/// `FieldTable` every time it is declared; the broker rejects a redeclare whose
/// arguments differ from the existing queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) args: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name and no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets `x-queue-type`.
    pub fn kind(mut self, kind: &QueueKind) -> Self {
        self.args.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from(kind.as_str())),
        );
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    ///
    /// Expired messages are dead-lettered when a dead letter exchange is set.
    pub fn ttl(mut self, ttl_ms: u32) -> Self {
        self.args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(LongLongInt::from(ttl_ms)),
        );
        self
    }

    /// Routes rejected or expired messages to `exchange`.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        self
    }

    /// Overrides the routing key of dead-lettered messages.
    ///
    /// An empty key is ignored so the message keeps its original routing key.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        if key.is_empty() {
            return self;
        }

        self.args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key)),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Returns a declared argument, if present.
    pub fn arg(&self, key: &str) -> Option<&AMQPValue> {
        self.args.get(&ShortString::from(key))
    }

    pub(crate) fn options(&self) -> lapin::options::QueueDeclareOptions {
        lapin::options::QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.args.clone())
    }
}

/// A queue as declared on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    name: String,
    message_count: u32,
    consumer_count: u32,
}

impl QueueHandle {
    pub fn new(name: &str, message_count: u32, consumer_count: u32) -> QueueHandle {
        QueueHandle {
            name: name.to_owned(),
            message_count,
            consumer_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages ready in the queue when it was declared.
    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    /// Consumers attached to the queue when it was declared.
    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }
}

impl From<lapin::Queue> for QueueHandle {
    fn from(queue: lapin::Queue) -> Self {
        QueueHandle::new(
            queue.name().as_str(),
            queue.message_count(),
            queue.consumer_count(),
        )
    }
}

/// Configuration for binding a queue to an exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange and routing key.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
