// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # JSON Publishing
//!
//! Serializes a value to JSON and publishes it through a [`Channel`], carrying
//! the caller's OpenTelemetry context in the message headers.

use crate::{channel::Channel, errors::AmqpError, otel};
use lapin::{options::BasicPublishOptions, types::ShortString, BasicProperties};
use opentelemetry::Context;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

impl Channel {
    /// Publishes `payload` as a JSON message.
    ///
    /// The message gets the JSON content type, a fresh message id and the
    /// trace context of `ctx` in its headers.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &T,
    ) -> Result<(), AmqpError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError(err.to_string())
        })?;

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(otel::inject_headers(ctx));

        self.publish(
            exchange,
            routing_key,
            &data,
            BasicPublishOptions::default(),
            properties,
        )
        .await
    }
}
