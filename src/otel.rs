// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Context Propagation
//!
//! Carries the trace context across the broker in AMQP message headers using
//! the globally registered text map propagator. With no propagator installed
//! both directions are no-ops.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};
use std::collections::BTreeMap;
use tracing::error;

/// Writes propagation fields into outgoing message headers.
struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl Injector for HeaderInjector<'_> {
    /// Stores `value` as a long string under the lowercased `key`.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

/// Reads propagation fields from incoming message headers.
struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<ShortString, AMQPValue>,
}

impl Extractor for HeaderExtractor<'_> {
    /// Gets a trace context value from the headers.
    ///
    /// # Parameters
    /// * `key` - The header key to retrieve
    ///
    /// # Returns
    /// The header value when it is a UTF-8 long string, None otherwise
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Writes `ctx` into `headers`.
///
/// # Parameters
/// * `ctx` - The context to propagate, usually `Context::current()`
/// * `headers` - Headers of the message about to be published
pub(crate) fn inject(ctx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers })
    });
}

/// Reads the remote context out of message headers.
///
/// # Returns
/// The extracted context, or an empty one when `headers` is None or carries
/// no trace fields
pub(crate) fn extract(headers: Option<&FieldTable>) -> Context {
    let empty = BTreeMap::new();
    let headers = headers.map(|table| table.inner()).unwrap_or(&empty);

    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor { headers }))
}
