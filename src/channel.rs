// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Auto-Recreating AMQP Channel
//!
//! A [`Channel`] wraps one logical channel of a
//! [`Connection`](crate::connection::Connection). A supervisor task watches the
//! current channel handle; when the broker or the network closes it, the
//! supervisor opens a new channel on the connection's *current* handle,
//! re-applies the prefetch limit and swaps it in. Callers keep using the same
//! `Channel` value (it is cheap to clone) and never see the replacement.
//!
//! Only [`Channel::close`] or closing the parent connection ends a channel.

use crate::{
    broker::{ChannelHandle, ConnectionHandle, ConsumeOptions},
    delivery::Deliveries,
    errors::AmqpError,
    lifecycle::{Lifecycle, Status},
    pump,
    queue::QueueHandle,
    reconnect::{retry_forever, wait_for_closure, Closure, ReconnectPolicy},
};
use arc_swap::ArcSwap;
use lapin::types::FieldTable;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Prefetch count applied to every channel unless configured otherwise
pub const DEFAULT_PREFETCH_COUNT: u16 = 20;

/// The connection handle currently installed by the connection supervisor.
pub(crate) type CurrentConnection = Arc<ArcSwap<Box<dyn ConnectionHandle>>>;

/// Opens a channel on `conn` and applies the prefetch limit.
pub(crate) async fn open_channel(
    conn: &dyn ConnectionHandle,
    prefetch_count: u16,
) -> Result<Box<dyn ChannelHandle>, AmqpError> {
    let channel = conn.create_channel().await?;

    if let Err(err) = channel.basic_qos(prefetch_count).await {
        error!(
            error = err.to_string(),
            prefetch_count, "amqp channel qos setting failed"
        );
        let _ = channel.close().await;
        return Err(err);
    }

    Ok(channel)
}

pub(crate) struct ChannelShared {
    handle: ArcSwap<Box<dyn ChannelHandle>>,
    connection: CurrentConnection,
    state: Lifecycle,
    prefetch_count: u16,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

impl ChannelShared {
    pub(crate) fn current(&self) -> Arc<Box<dyn ChannelHandle>> {
        self.handle.load_full()
    }

    /// Closed, closing, or cancelled by the parent connection.
    pub(crate) fn is_closed(&self) -> bool {
        self.state.is_closed() || self.shutdown.is_cancelled()
    }

    pub(crate) fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// A channel that survives broker-initiated closures.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Wraps an opened channel and starts its supervisor.
    pub(crate) fn spawn(
        handle: Box<dyn ChannelHandle>,
        connection: CurrentConnection,
        prefetch_count: u16,
        policy: ReconnectPolicy,
        shutdown: CancellationToken,
    ) -> Channel {
        let shared = Arc::new(ChannelShared {
            handle: ArcSwap::from_pointee(handle),
            connection,
            state: Lifecycle::default(),
            prefetch_count,
            policy,
            shutdown,
            generation: AtomicU64::new(0),
        });

        tokio::spawn(watch(shared.clone()));

        Channel { shared }
    }

    /// True once the channel was closed by its owner or its connection.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn status(&self) -> Status {
        self.shared.state.status()
    }

    /// How many times the underlying channel was recreated.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn prefetch_count(&self) -> u16 {
        self.shared.prefetch_count
    }

    /// Closes the channel for good.
    ///
    /// The closed state is recorded before the broker channel is closed so the
    /// supervisor does not mistake this closure for a failure. Fails with
    /// [`AmqpError::AlreadyClosed`] when called again.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.shared.shutdown.is_cancelled() || !self.shared.state.begin_close() {
            return Err(AmqpError::AlreadyClosed);
        }

        self.shared.shutdown.cancel();
        let result = self.shared.current().close().await;
        self.shared.state.finish_close();

        debug!("amqp channel closed by developer");
        result
    }

    /// Starts consuming `queue` and returns a stream that keeps yielding
    /// deliveries across channel recreation.
    ///
    /// Returns immediately; a failing `basic.consume` is retried in the
    /// background. Fails only when the channel is already closed.
    pub fn consume(
        &self,
        queue: &str,
        consumer: &str,
        options: ConsumeOptions,
        args: FieldTable,
    ) -> Result<Deliveries, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ChannelClosed);
        }

        let (tx, rx) = mpsc::channel(1);
        let request = pump::ConsumeRequest {
            queue: queue.to_owned(),
            consumer: consumer.to_owned(),
            options,
            args,
        };

        tokio::spawn(pump::run(self.shared.clone(), request, tx));

        Ok(Deliveries::new(rx))
    }

    /// Consumes `queue` with manual acknowledgement and a broker generated
    /// consumer tag.
    pub fn read_message(&self, queue: &QueueHandle) -> Result<Deliveries, AmqpError> {
        self.consume(
            queue.name(),
            "",
            ConsumeOptions::default(),
            FieldTable::default(),
        )
        .inspect_err(|err| {
            error!(
                error = err.to_string(),
                queue = queue.name(),
                "amqp operation failed"
            )
        })
    }

    pub(crate) fn current(&self) -> Arc<Box<dyn ChannelHandle>> {
        self.shared.current()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_closed() {
            error!("amqp operation on a closed channel");
            return Err(AmqpError::ChannelClosed);
        }
        Ok(())
    }
}

async fn watch(shared: Arc<ChannelShared>) {
    loop {
        let handle = shared.current();
        let notification = handle.notify_close();

        let reason =
            match wait_for_closure(notification, handle.is_connected(), &shared.shutdown).await {
                Closure::Reason(reason) if !shared.is_closed() => reason,
                _ => {
                    // the broker may have closed the channel together with the connection
                    shared.state.force_close();
                    debug!("amqp channel supervisor stopped");
                    return;
                }
            };
        drop(handle);

        error!(reason = %reason, "amqp channel closed");

        let connection = shared.connection.clone();
        let prefetch_count = shared.prefetch_count;
        let recreated = retry_forever(
            &shared.policy,
            &shared.shutdown,
            "amqp channel recreate",
            || {
                let conn = connection.load_full();
                async move { open_channel(&**conn, prefetch_count).await }
            },
        )
        .await;

        let Some(channel) = recreated else {
            shared.state.force_close();
            return;
        };

        if !install(&shared, channel).await {
            return;
        }
        shared.generation.fetch_add(1, Ordering::AcqRel);
        info!(prefetch_count, "amqp channel recreate success");
    }
}

/// Stores `channel` as the current handle, then closes it again when the
/// channel was closed meanwhile. Returns false in that case.
async fn install(shared: &ChannelShared, channel: Box<dyn ChannelHandle>) -> bool {
    shared.handle.store(Arc::new(channel));
    if !shared.is_closed() {
        return true;
    }

    let _ = shared.handle.load_full().close().await;
    false
}
