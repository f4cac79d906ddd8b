// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module defines the handler contract for consumers registered on a
//! [`crate::channel::Channel`], the message type handed to those handlers, and
//! the delivery wrapper placed between the broker client and a handler.
//!
//! The wrapper runs every delivery on its own task inside a consumer span.
//! Whatever the handler does (returns an error, panics, or never finishes) is
//! confined to that task: the failure is logged and recorded on the span, and
//! neither the consumer, its channel nor the broker client are affected.

use crate::{errors::AmqpError, otel, transport::DeliveryCallback};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{message::Delivery, types::FieldTable, BasicProperties};
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::runtime::Handle;
use tracing::{debug, error};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Processes messages delivered to a consumer.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Handles one delivery.
    ///
    /// `ctx` is the trace context propagated by the publisher, if any. An
    /// error is logged and otherwise ignored; acknowledging the message is the
    /// handler's responsibility (see `Channel::ack`).
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// A message delivered by the broker, either pushed to a consumer or fetched
/// with `Channel::get`.
#[derive(Debug, Clone, Default)]
pub struct ConsumerMessage {
    /// Tag of the consumer the message was delivered to; empty for fetched messages
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

impl ConsumerMessage {
    pub(crate) fn from_delivery(consumer_tag: &str, delivery: Delivery) -> Self {
        ConsumerMessage {
            consumer_tag: consumer_tag.to_owned(),
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
        }
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(
                error = err.to_string(),
                routing_key = self.routing_key,
                "failure to parse payload"
            );
            AmqpError::ParsePayloadError(err.to_string())
        })
    }

    /// How many times the broker dead-lettered this message, read from the
    /// first entry of the `x-death` header. Zero when the header is absent.
    pub fn death_count(&self) -> i64 {
        let headers = match self.properties.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        headers
            .inner()
            .get(AMQP_HEADERS_X_DEATH)
            .and_then(|value| value.as_array())
            .and_then(|arr| arr.as_slice().first())
            .and_then(|value| value.as_field_table())
            .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
            .and_then(|value| value.as_long_long_int())
            .unwrap_or_default()
    }
}

/// Wraps `handler` into the callback given to the broker client.
///
/// Must be called from within a tokio runtime; deliveries are handled on
/// tasks spawned on that runtime.
pub(crate) fn dispatcher(queue: &str, handler: Arc<dyn ConsumerHandler>) -> DeliveryCallback {
    let runtime = Handle::current();
    let queue = queue.to_owned();

    Arc::new(move |msg: ConsumerMessage| {
        let handler = handler.clone();
        let queue = queue.clone();
        runtime.spawn(async move { consume(&queue, handler.as_ref(), msg).await });
    })
}

/// Runs the handler for a single delivery and contains its failures.
async fn consume(queue: &str, handler: &dyn ConsumerHandler, msg: ConsumerMessage) {
    let tracer = global::tracer("amqp consumer");
    let (ctx, mut span) = otel::new_span(&msg.properties, &tracer, queue);

    debug!(
        queue,
        routing_key = msg.routing_key,
        exchange = msg.exchange,
        "received message"
    );

    match AssertUnwindSafe(handler.exec(&ctx, &msg))
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            span.set_status(Status::Ok);
        }
        Ok(Err(err)) => {
            error!(
                error = err.to_string(),
                queue,
                routing_key = msg.routing_key,
                "failure to handle message"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to handle message"),
            });
        }
        Err(_) => {
            error!(
                queue,
                routing_key = msg.routing_key,
                "message handler panicked"
            );
            span.set_status(Status::Error {
                description: Cow::from("message handler panicked"),
            });
        }
    }
}
