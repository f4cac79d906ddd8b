// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient AMQP Layer
//!
//! This module provides the error type shared by every operation of the crate.
//! Connection and channel faults reported by the broker are handled internally
//! (cache invalidation and scheduled reconnection); the variants below are what
//! callers observe when a connection can not be established, when a forwarded
//! operation is rejected by the broker, or when a handle is used after close.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// The type is `Clone` because a single connection attempt is shared by every
/// caller that joined it, and all of them receive the same outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Connection settings could not be loaded
    #[error("failure to load the configuration: {0}")]
    ConfigError(String),

    /// Every connection attempt to the endpoint failed
    #[error("failure to connect to `{0}`")]
    ConnectionError(String),

    /// The connection was closed while a connection attempt was in flight
    #[error("connection was closed while connecting")]
    ConnectionClosed,

    /// The channel outlived the connection it was created from
    #[error("connection no longer exists")]
    ConnectionDropped,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// The channel was explicitly closed and can not be used anymore
    #[error("channel was closed")]
    ChannelClosed,

    /// Error declaring or checking an exchange
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error deleting an exchange
    #[error("failure to delete an exchange `{0}`")]
    DeleteExchangeError(String),

    /// Error binding or unbinding an exchange to another exchange
    #[error("failure to binding exchange `{0}` to exchange `{1}`")]
    BindingExchangeError(String, String),

    /// Error declaring or checking a queue
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error deleting a queue
    #[error("failure to delete a queue `{0}`")]
    DeleteQueueError(String),

    /// Error purging a queue
    #[error("failure to purge a queue `{0}`")]
    PurgeQueueError(String),

    /// Error binding or unbinding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error waiting for publisher confirms
    #[error("failure to confirm: {0}")]
    ConfirmError(String),

    /// Error serializing or parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error declaring a consumer on the given queue
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error fetching a single message
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error asking the broker to redeliver unacknowledged messages
    #[error("failure to recover")]
    RecoverError,

    /// Error raised by a message handler
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}
