// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Types describing the exchanges the topology builder declares. Every primary
//! exchange has a twin named `<exchange>.retry` of the same kind that receives
//! dead-lettered messages from the primary queues.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Suffix appended to exchange names, queue names and routing keys of the retry path
pub const RETRY_SUFFIX: &str = ".retry";

/// Returns the name of the retry exchange paired with `exchange`.
pub fn retry_exchange_name(exchange: &str) -> String {
    format!("{exchange}{RETRY_SUFFIX}")
}

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - Custom: Any plugin provided exchange type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Custom(String),
}

impl ExchangeKind {
    pub fn as_str(&self) -> &str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Custom(kind) => kind,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(AmqpError::DeclareExchangeError(
                "empty exchange type".to_owned(),
            )),
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Ok(ExchangeKind::Custom(other.to_owned())),
        }
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Built with chained setters, then handed to the broker handle for declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable Direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: &ExchangeKind) -> Self {
        self.kind = kind.clone();
        self
    }

    /// Adds a single parameter to the exchange.
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub(crate) fn options(&self) -> lapin::options::ExchangeDeclareOptions {
        lapin::options::ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_exchange_is_suffixed() {
        assert_eq!(retry_exchange_name("orders"), "orders.retry");
    }

    #[test]
    fn parses_known_and_plugin_kinds() {
        assert_eq!("topic".parse::<ExchangeKind>(), Ok(ExchangeKind::Topic));
        assert_eq!(
            "x-consistent-hash".parse::<ExchangeKind>(),
            Ok(ExchangeKind::Custom("x-consistent-hash".to_owned()))
        );
        assert!("".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn durable_definition_maps_to_declare_options() {
        let def = ExchangeDefinition::new("orders")
            .kind(&ExchangeKind::Fanout)
            .durable();

        let opts = def.options();
        assert!(opts.durable);
        assert!(!opts.auto_delete);
        assert!(!opts.internal);
        assert!(!opts.nowait);
        assert_eq!(def.exchange_kind().as_str(), "fanout");
    }

    #[test]
    fn flags_and_params_reach_the_declaration() {
        let def = ExchangeDefinition::new("orders.dlx")
            .kind(&ExchangeKind::Headers)
            .param(
                ShortString::from("alternate-exchange"),
                AMQPValue::LongString("orders.unrouted".into()),
            )
            .delete()
            .passive()
            .internal();

        let opts = def.options();
        assert!(opts.auto_delete);
        assert!(opts.passive);
        assert!(opts.internal);
        assert!(!opts.durable);
        assert!(!def.is_durable());

        let args = def.arguments();
        assert_eq!(
            args.inner().get("alternate-exchange"),
            Some(&AMQPValue::LongString("orders.unrouted".into()))
        );
    }
}
