// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Policy and Supervision
//!
//! Delay policy shared by the connection watcher, the channel watcher and the
//! delivery pump. The default waits a fixed 3 seconds between attempts and
//! retries forever; an exponential policy with jitter is available for
//! deployments that prefer it. Supervisors never give up: `alert_after` only
//! escalates the log level once the attempt count is reached.

use crate::{
    broker::{CloseNotification, CloseReason},
    errors::AmqpError,
};
use std::{future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Delay used between attempts when nothing else is configured
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    Fixed,
    Exponential { max_delay: Duration },
}

/// How long supervisors wait between attempts to restore a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delay: Duration,
    backoff: Backoff,
    alert_after: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Waits `delay` before every attempt.
    pub fn fixed(delay: Duration) -> Self {
        ReconnectPolicy {
            delay,
            backoff: Backoff::Fixed,
            alert_after: None,
        }
    }

    /// Doubles the wait after every failed attempt, starting at `initial` and
    /// capped at `max_delay`, with +/-15% jitter.
    pub fn exponential(initial: Duration, max_delay: Duration) -> Self {
        ReconnectPolicy {
            delay: initial,
            backoff: Backoff::Exponential {
                max_delay: max_delay.max(initial),
            },
            alert_after: None,
        }
    }

    /// Logs at `warn` level once `attempts` consecutive attempts have failed.
    pub fn alert_after(mut self, attempts: u32) -> Self {
        self.alert_after = Some(attempts);
        self
    }

    /// Pause applied by the delivery pump between consume sessions.
    pub fn cooldown(&self) -> Duration {
        self.delay
    }

    /// Delay before attempt number `attempt` (0 based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let factor = 2u32.saturating_pow(attempt.min(16));
                let base = self.delay.saturating_mul(factor).min(max_delay);
                let jitter = rand::random::<f64>() * 0.3 - 0.15;
                Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
                    .unwrap_or(max_delay)
            }
        }
    }

    fn should_alert(&self, attempts: u32) -> bool {
        self.alert_after.is_some_and(|n| attempts == n)
    }
}

/// How a supervised handle stopped.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Closure {
    /// The owner closed the resource.
    Shutdown,
    /// The handle went away without reporting an error.
    Silent,
    /// The broker or the network closed it.
    Reason(CloseReason),
}

/// Waits until the handle behind `notification` is closed.
///
/// `connected` is the handle status sampled after registering, which catches
/// a closure that happened before the registration.
pub(crate) async fn wait_for_closure(
    notification: CloseNotification,
    connected: bool,
    shutdown: &CancellationToken,
) -> Closure {
    if !connected && !shutdown.is_cancelled() {
        return Closure::Reason(CloseReason::new("not connected"));
    }

    tokio::select! {
        _ = shutdown.cancelled() => Closure::Shutdown,
        received = notification => match received {
            Ok(reason) => Closure::Reason(reason),
            Err(_) => Closure::Silent,
        },
    }
}

/// Sleeps for `delay` unless `shutdown` fires first. Returns false on shutdown.
pub(crate) async fn sleep_or_cancel(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Runs `attempt` until it succeeds, sleeping before every try.
///
/// Returns `None` only when `shutdown` is cancelled.
pub(crate) async fn retry_forever<T, F, Fut>(
    policy: &ReconnectPolicy,
    shutdown: &CancellationToken,
    what: &str,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AmqpError>>,
{
    let mut attempts = 0u32;

    loop {
        if !sleep_or_cancel(policy.delay_for(attempts), shutdown).await {
            return None;
        }

        attempts = attempts.saturating_add(1);

        let result = tokio::select! {
            _ = shutdown.cancelled() => return None,
            result = attempt() => result,
        };

        match result {
            Ok(value) => return Some(value),
            Err(err) if policy.should_alert(attempts) => {
                warn!(error = err.to_string(), attempts, "{} still failing", what)
            }
            Err(err) => error!(error = err.to_string(), attempts, "{} failed", what),
        }
    }
}
