// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Open/closing/closed state shared by connections and channels.
//!
//! Transitions only move forward. An explicit close moves `Open -> Closing`
//! before the broker handle is closed, so a supervisor that sees the broker
//! closure afterwards knows not to repair it.
//!
//! All accesses are `SeqCst`: supervisors store a replacement handle and then
//! read the state, while `close` writes the state and then loads the handle.
//! Either side must observe the other.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a [`Connection`](crate::connection::Connection) or a
/// [`Channel`](crate::channel::Channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Usable, and repaired by its supervisor after a broker closure.
    Open = 0,
    /// An explicit close is in progress.
    Closing = 1,
    /// Permanently closed, either explicitly or because the handle went away.
    Closed = 2,
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Status::Open,
            1 => Status::Closing,
            _ => Status::Closed,
        }
    }
}

/// Atomic [`Status`] cell. Transitions are compare-and-swap so only one
/// caller wins a close.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle(AtomicU8::new(Status::Open as u8))
    }
}

impl Lifecycle {
    /// Current state.
    pub(crate) fn status(&self) -> Status {
        Status::from(self.0.load(Ordering::SeqCst))
    }

    /// True once a close has started.
    pub(crate) fn is_closed(&self) -> bool {
        self.status() != Status::Open
    }

    /// `Open -> Closing`. False when someone else already closed.
    pub(crate) fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                Status::Open as u8,
                Status::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// `Closing -> Closed`, after the handle was closed.
    pub(crate) fn finish_close(&self) {
        self.0.store(Status::Closed as u8, Ordering::SeqCst);
    }

    /// `Open -> Closed` without a handle close. False when not open.
    pub(crate) fn force_close(&self) -> bool {
        self.0
            .compare_exchange(
                Status::Open as u8,
                Status::Closed as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}
