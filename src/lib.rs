// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
mod pump;

pub mod broker;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod delivery;
pub mod errors;
pub mod exchange;
pub mod lapin_broker;
pub mod lifecycle;
pub mod publisher;
pub mod queue;
pub mod reconnect;
pub mod topology;
