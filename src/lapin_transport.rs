// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Production implementation of the [`crate::transport`] traits on top of the
//! `lapin` AMQP client. Each method maps one-to-one onto the lapin primitive
//! of the same name; lapin errors are logged and turned into the matching
//! [`AmqpError`] variant carrying the broker's reason.
//!
//! lapin only reports faults, so these handles never emit
//! [`LinkEvent::Closed`]. An orderly close is noticed through `is_open()` the
//! next time the handle is looked up.

use crate::{
    consumer::ConsumerMessage,
    errors::AmqpError,
    transport::{
        ConsumeOptions, DeliveryCallback, EventListener, LinkEvent, QueueInfo, RawChannel,
        RawConnection, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicGetOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, BasicRejectOptions,
        ConfirmSelectOptions, ExchangeBindOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// Opens connections with `lapin`.
#[derive(Default)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    /// Creates a transport reporting `connection_name` to the broker.
    pub fn new(connection_name: Option<&str>) -> Self {
        let properties = match connection_name {
            Some(name) => ConnectionProperties::default()
                .with_connection_name(LongString::from(name.to_owned())),
            None => ConnectionProperties::default(),
        };

        LapinTransport { properties }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn open(&self, uri: &str) -> Result<Arc<dyn RawConnection>, AmqpError> {
        debug!("creating amqp connection...");

        match Connection::connect(uri, self.properties.clone()).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    conn: Connection,
}

impl LapinConnection {
    async fn new_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");

        match self.conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl RawConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        let channel = self.new_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        let channel = self.new_channel().await?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError(err.to_string()));
        }

        Ok(Arc::new(LapinChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_event(&self, listener: EventListener) {
        self.conn
            .on_error(move |err| listener(LinkEvent::Error(err.to_string())));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl RawChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn on_event(&self, listener: EventListener) {
        self.channel
            .on_error(move |err| listener(LinkEvent::Error(err.to_string())));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                warn!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        match self.channel.queue_declare(queue, options, arguments).await {
            Ok(declared) => Ok(QueueInfo {
                name: declared.name().to_string(),
                message_count: declared.message_count(),
                consumer_count: declared.consumer_count(),
            }),
            Err(err) => {
                error!(error = err.to_string(), queue, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(err.to_string()))
            }
        }
    }

    async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(queue, options)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to delete the queue");
                AmqpError::DeleteQueueError(err.to_string())
            })
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to purge the queue");
                AmqpError::PurgeQueueError(err.to_string())
            })
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: lapin::ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(exchange, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exchange,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(err.to_string())
            })
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(exchange, options)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exchange,
                    "error to delete the exchange"
                );
                AmqpError::DeleteExchangeError(err.to_string())
            })
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind exchanges");
                AmqpError::BindingExchangeError(source.to_owned(), destination.to_owned())
            })
    }

    async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                arguments,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind exchanges");
                AmqpError::BindingExchangeError(source.to_owned(), destination.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        match confirm.await {
            Ok(confirmation) if confirmation.is_nack() => {
                warn!(exchange, routing_key, "message was nacked by the broker");
                Err(AmqpError::ConfirmError("message was nacked".to_owned()))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::ConfirmError(err.to_string()))
            }
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        deliver: DeliveryCallback,
    ) -> Result<String, AmqpError> {
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("ctag-{}", Uuid::new_v4()));

        let mut consumer = match self
            .channel
            .basic_consume(queue, &tag, options.options, options.arguments.clone())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let consumer_tag = tag.clone();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => deliver(ConsumerMessage::from_delivery(&consumer_tag, delivery)),
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!(consumer_tag, "consumer stream finished");
        });

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<ConsumerMessage>, AmqpError> {
        match self.channel.basic_get(queue, options).await {
            Ok(message) => Ok(message.map(|m| ConsumerMessage::from_delivery("", m.delivery))),
            Err(err) => {
                error!(error = err.to_string(), queue, "error to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
        }
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_recover(&self, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_recover(BasicRecoverOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to recover");
                AmqpError::RecoverError
            })
    }

    async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        match self.channel.wait_for_confirms().await {
            Ok(returned) => {
                if !returned.is_empty() {
                    warn!(count = returned.len(), "messages were returned by the broker");
                }
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "error waiting for confirms");
                Err(AmqpError::ConfirmError(err.to_string()))
            }
        }
    }
}
