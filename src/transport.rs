// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Boundary
//!
//! Object-safe traits describing what the resilience layer needs from the
//! underlying AMQP client: opening connections, opening sessions on them,
//! observing their `error`/`close` notifications, and the session primitives
//! that `Channel` forwards to. The production implementation lives in
//! [`crate::lapin_transport`].

use crate::{consumer::ConsumerMessage, errors::AmqpError};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicConsumeOptions, BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use std::sync::Arc;

/// Notification emitted by a raw connection or a raw session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Unexpected fault; the handle is unusable from now on
    Error(String),
    /// Orderly or final closure. Not every client reports it; a closed
    /// handle is also detected through `is_open()`.
    Closed,
}

/// Observer registered on a raw connection or session.
pub type EventListener = Box<dyn Fn(LinkEvent) + Send + Sync>;

/// Callback receiving every delivery of a consumer.
pub type DeliveryCallback = Arc<dyn Fn(ConsumerMessage) + Send + Sync>;

/// Opens raw connections to a broker endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single connection attempt.
    async fn open(&self, uri: &str) -> Result<Arc<dyn RawConnection>, AmqpError>;
}

/// A live transport connection.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Opens a plain session on this connection.
    ///
    /// # Returns
    /// The new session, or `AmqpError::ChannelError` when the connection
    /// refuses it.
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError>;

    /// Opens a session with publisher confirms enabled.
    async fn create_confirm_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError>;

    /// Whether the connection can still open sessions.
    fn is_open(&self) -> bool;

    /// Registers `listener` for every later fault or closure of the connection.
    fn on_event(&self, listener: EventListener);

    /// Closes the connection and every session opened on it.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Reply of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Options of a consumer subscription.
///
/// Once a consumer is registered its tag is written back into `consumer_tag`,
/// so that every replay on a new session reuses the same identity.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOptions {
    pub consumer_tag: Option<String>,
    pub options: BasicConsumeOptions,
    pub arguments: FieldTable,
}

impl ConsumeOptions {
    /// Subscribes under `tag` instead of a generated one.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// Deliveries are considered acknowledged as soon as they are sent.
    pub fn no_ack(mut self) -> Self {
        self.options.no_ack = true;
        self
    }

    /// Only this consumer may read from the queue.
    pub fn exclusive(mut self) -> Self {
        self.options.exclusive = true;
        self
    }

    /// Broker-specific arguments of the subscription (`x-priority`, ...).
    pub fn arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }
}

/// A live transport-level session (an AMQP channel).
#[async_trait]
pub trait RawChannel: Send + Sync {
    /// Whether the session is still usable. A session closed by the broker
    /// after a rejected operation reports `false`.
    fn is_open(&self) -> bool;

    /// Registers `listener` for every later fault or closure of the session.
    fn on_event(&self, listener: EventListener);

    async fn close(&self) -> Result<(), AmqpError>;

    /// Declares a queue, or checks it exists when `options.passive` is set.
    ///
    /// # Parameters
    /// * `queue` - Queue name; empty lets the broker pick one
    /// * `options` - Durability, exclusivity, auto-delete and passive flags
    /// * `arguments` - Queue arguments such as `x-dead-letter-exchange`
    ///
    /// # Returns
    /// The declared name with its message and consumer counts.
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    /// Returns the number of messages deleted with the queue.
    async fn queue_delete(&self, queue: &str, options: QueueDeleteOptions)
        -> Result<u32, AmqpError>;

    /// Returns the number of messages purged.
    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError>;

    /// Routes messages published to `exchange` with `routing_key` into `queue`.
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Removes a binding made by [`RawChannel::queue_bind`].
    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Declares an exchange, or checks it exists when `options.passive` is set.
    ///
    /// # Parameters
    /// * `exchange` - Exchange name
    /// * `kind` - Routing algorithm of the exchange
    /// * `options` - Durability, auto-delete, internal and passive flags
    /// * `arguments` - Exchange arguments such as `alternate-exchange`
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: lapin::ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError>;

    /// Routes messages published to `source` with `routing_key` into the
    /// `destination` exchange.
    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Removes a binding made by [`RawChannel::exchange_bind`].
    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    /// Publishes a message without waiting for any broker acknowledgement.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; empty for the default exchange
    /// * `routing_key` - Routing key, the queue name for the default exchange
    /// * `options` - Mandatory and immediate flags
    /// * `payload` - Message body
    /// * `properties` - Content type, headers, message id, ...
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker to confirm this message.
    async fn basic_publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `options` - Consumer tag to reuse, flags and arguments
    /// * `deliver` - Called once per delivery
    ///
    /// # Returns
    /// The consumer tag, generated when `options.consumer_tag` is `None`.
    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        deliver: DeliveryCallback,
    ) -> Result<String, AmqpError>;

    /// Stops the consumer registered under `consumer_tag`.
    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Fetches one message from `queue`, `None` when it is empty.
    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<ConsumerMessage>, AmqpError>;

    /// Acknowledges `delivery_tag`, and every earlier delivery when
    /// `multiple` is set. Tag `0` with `multiple` covers all outstanding ones.
    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    /// Negatively acknowledges deliveries, like [`RawChannel::basic_ack`],
    /// requeueing them when `requeue` is set.
    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError>;

    /// Rejects a single delivery.
    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries, per consumer or for
    /// the whole session when `global` is set.
    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    /// Asks the broker to redeliver every unacknowledged delivery.
    async fn basic_recover(&self, requeue: bool) -> Result<(), AmqpError>;

    /// Waits until every outstanding publish of a confirm session is settled.
    async fn wait_for_confirms(&self) -> Result<(), AmqpError>;
}
