// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Auto-Reconnecting AMQP Connection
//!
//! A [`Connection`] owns one long-lived broker connection. Dialing is a single
//! attempt; once connected, a supervisor task waits for the broker or the
//! network to close the connection and then redials the same URL until it
//! succeeds, swapping the new handle in place. Channels opened from the
//! connection always recreate themselves on the handle that is current at the
//! time.
//!
//! # Example
//! ```no_run
//! use rabbitmq_resilience::{configs::AmqpConfigs, connection::Connection};
//!
//! # async fn run() -> Result<(), rabbitmq_resilience::errors::AmqpError> {
//! let cfg = AmqpConfigs::from_env()?;
//! let conn = Connection::dial_with_configs(&cfg).await?;
//! let channel = conn.channel().await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    broker::{ConnectionHandle, Dialer},
    channel::{open_channel, Channel, CurrentConnection, DEFAULT_PREFETCH_COUNT},
    configs::{redact_url, AmqpConfigs},
    errors::AmqpError,
    lapin_broker::LapinDialer,
    lifecycle::{Lifecycle, Status},
    reconnect::{retry_forever, wait_for_closure, Closure, ReconnectPolicy},
};
use arc_swap::ArcSwap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Settings applied to a connection and to every channel opened from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub prefetch_count: u16,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&AmqpConfigs> for ConnectionSettings {
    fn from(cfg: &AmqpConfigs) -> Self {
        ConnectionSettings {
            prefetch_count: cfg.prefetch_count,
            reconnect: cfg.reconnect,
        }
    }
}

struct ConnectionShared {
    url: String,
    dialer: Arc<dyn Dialer>,
    handle: CurrentConnection,
    settings: ConnectionSettings,
    state: Lifecycle,
    shutdown: CancellationToken,
    generation: AtomicU64,
}

/// A broker connection that redials after broker-initiated closures.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Dials `url` once with default settings.
    pub async fn dial(url: &str) -> Result<Connection, AmqpError> {
        Connection::connect(
            Arc::new(LapinDialer::new()),
            url,
            ConnectionSettings::default(),
        )
        .await
    }

    /// Dials the broker described by `cfg`, naming the connection after the
    /// application.
    pub async fn dial_with_configs(cfg: &AmqpConfigs) -> Result<Connection, AmqpError> {
        let dialer = LapinDialer::new().with_connection_name(&cfg.app_name);
        Connection::connect(Arc::new(dialer), &cfg.uri(), ConnectionSettings::from(cfg)).await
    }

    /// Dials `url` once through `dialer` and starts the supervisor.
    pub async fn connect(
        dialer: Arc<dyn Dialer>,
        url: &str,
        settings: ConnectionSettings,
    ) -> Result<Connection, AmqpError> {
        debug!(url = %redact_url(url), "creating amqp connection...");
        let handle = dialer.dial(url).await?;
        debug!("amqp connected");

        let shared = Arc::new(ConnectionShared {
            url: url.to_owned(),
            dialer,
            handle: Arc::new(ArcSwap::from_pointee(handle)),
            settings,
            state: Lifecycle::default(),
            shutdown: CancellationToken::new(),
            generation: AtomicU64::new(0),
        });

        tokio::spawn(watch(shared.clone()));

        Ok(Connection { shared })
    }

    /// Opens a channel on the current connection with the configured prefetch.
    pub async fn channel(&self) -> Result<Channel, AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::ConnectionError("connection is closed".to_owned()));
        }

        debug!("creating amqp channel...");
        let prefetch_count = self.shared.settings.prefetch_count;
        let conn = self.shared.handle.load_full();
        let handle = open_channel(&**conn, prefetch_count).await?;
        debug!(prefetch_count, "channel created");

        Ok(Channel::spawn(
            handle,
            self.shared.handle.clone(),
            prefetch_count,
            self.shared.settings.reconnect,
            self.shared.shutdown.child_token(),
        ))
    }

    /// Closes the connection and every channel opened from it.
    ///
    /// Stops the supervisor before closing the handle. Fails with
    /// [`AmqpError::AlreadyClosed`] when called again.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if !self.shared.state.begin_close() {
            return Err(AmqpError::AlreadyClosed);
        }

        self.shared.shutdown.cancel();
        let result = self.shared.handle.load_full().close().await;
        self.shared.state.finish_close();

        debug!("amqp connection closed by developer");
        result
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Number of successful reconnects.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.is_closed()
    }

    pub fn status(&self) -> Status {
        self.shared.state.status()
    }
}

async fn watch(shared: Arc<ConnectionShared>) {
    let url = redact_url(&shared.url);

    loop {
        let handle = shared.handle.load_full();
        let notification = handle.notify_close();

        let reason =
            match wait_for_closure(notification, handle.is_connected(), &shared.shutdown).await {
                Closure::Reason(reason) if !shared.state.is_closed() => reason,
                Closure::Silent => {
                    shared.state.force_close();
                    shared.shutdown.cancel();
                    debug!(url = %url, "amqp connection went away without an error");
                    return;
                }
                _ => {
                    debug!(url = %url, "amqp connection supervisor stopped");
                    return;
                }
            };
        drop(handle);

        error!(reason = %reason, url = %url, "amqp connection closed");

        let dialer = shared.dialer.clone();
        let target = shared.url.clone();
        let redialed = retry_forever(
            &shared.settings.reconnect,
            &shared.shutdown,
            "amqp reconnect",
            || {
                let dialer = dialer.clone();
                let target = target.clone();
                async move { dialer.dial(&target).await }
            },
        )
        .await;

        let Some(conn) = redialed else {
            return;
        };

        if !install(&shared, conn).await {
            return;
        }
        let generation = shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(url = %url, generation, "amqp reconnect success");
    }
}

/// Stores `conn` as the current handle unless the connection was closed.
///
/// The store happens before the state check, so a concurrent `close` either
/// sees the new handle or is seen here. Returns false when `conn` was closed
/// again.
async fn install(shared: &ConnectionShared, conn: Box<dyn ConnectionHandle>) -> bool {
    shared.handle.store(Arc::new(conn));
    if !shared.state.is_closed() {
        return true;
    }

    let _ = shared.handle.load_full().close().await;
    false
}
