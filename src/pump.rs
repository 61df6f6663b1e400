// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Delivery pump: relays raw consumer streams into the stable [`Deliveries`]
//! stream handed to the caller.
//!
//! A raw stream belongs to one broker channel and ends with it. The pump
//! re-issues `basic.consume` on whatever channel handle is current after a
//! cooldown, so the caller's stream only ends after the channel is closed or
//! the caller drops it. Relaying waits for the reader; nothing is dropped or
//! reordered.
//!
//! [`Deliveries`]: crate::delivery::Deliveries

use crate::{
    broker::ConsumeOptions,
    channel::ChannelShared,
    delivery::Delivery,
    reconnect::sleep_or_cancel,
};
use futures_util::StreamExt;
use lapin::types::FieldTable;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Arguments of `basic.consume`, kept so every session is issued the same way.
pub(crate) struct ConsumeRequest {
    /// Queue to consume from.
    pub(crate) queue: String,
    /// Consumer tag; empty lets the broker generate one per session.
    pub(crate) consumer: String,
    pub(crate) options: ConsumeOptions,
    pub(crate) args: FieldTable,
}

enum Relay {
    /// The raw stream ended; try again on the current channel.
    Ended,
    /// Shutdown or the reader went away.
    Stop,
}

/// Relays deliveries into `tx` until the channel closes or the reader drops
/// the receiving end.
///
/// # Parameters
/// * `shared` - State of the channel the consumer belongs to; every session
///   uses its current handle
/// * `request` - The `basic.consume` arguments repeated for each session
/// * `tx` - Sending half of the caller's [`Deliveries`](crate::delivery::Deliveries)
///
/// A failed `basic.consume` or an ended raw stream is followed by the policy
/// cooldown before the next session.
pub(crate) async fn run(
    shared: Arc<ChannelShared>,
    request: ConsumeRequest,
    tx: mpsc::Sender<Delivery>,
) {
    let shutdown = shared.shutdown().clone();
    let cooldown = shared.policy().cooldown();

    loop {
        if shutdown.is_cancelled() || tx.is_closed() {
            break;
        }

        let handle = shared.current();
        let consumed = tokio::select! {
            _ = shutdown.cancelled() => break,
            consumed = handle.basic_consume(
                &request.queue,
                &request.consumer,
                request.options,
                request.args.clone(),
            ) => consumed,
        };
        drop(handle);

        match consumed {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue = request.queue,
                    consumer = request.consumer,
                    auto_ack = request.options.auto_ack,
                    exclusive = request.options.exclusive,
                    "amqp consume failed"
                );
            }
            Ok(mut raw) => {
                debug!(queue = request.queue, "amqp consumer started");

                let relay = loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => break Relay::Stop,
                        next = raw.next() => next,
                    };

                    match next {
                        Some(Ok(delivery)) => {
                            let sent = tokio::select! {
                                _ = shutdown.cancelled() => break Relay::Stop,
                                sent = tx.send(delivery) => sent,
                            };
                            if sent.is_err() {
                                debug!(queue = request.queue, "deliveries dropped by the reader");
                                break Relay::Stop;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = err.to_string(), queue = request.queue, "amqp consumer stream failed");
                            break Relay::Ended;
                        }
                        None => break Relay::Ended,
                    }
                };

                if let Relay::Stop = relay {
                    break;
                }
            }
        }

        if !sleep_or_cancel(cooldown, &shutdown).await || shared.is_closed() {
            break;
        }
    }

    debug!(queue = request.queue, "amqp delivery pump stopped");
}
