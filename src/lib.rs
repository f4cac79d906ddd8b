// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient AMQP
//!
//! Connections and channels to a RabbitMQ broker that heal themselves: the
//! connection is opened on first use and re-established after it is lost, and
//! channels re-open their session and re-attach their consumers on their own.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod lapin_transport;
pub mod publisher;
pub mod transport;
