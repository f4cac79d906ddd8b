// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient AMQP Channel
//!
//! A [`Channel`] owns at most one live session on its connection. The session
//! is opened on first use and re-opened transparently after the broker closes
//! it or the connection is lost. Every consumer registered through
//! [`Channel::consume`] is kept in a registry and re-attached to each new
//! session before that session is handed to any caller.
//!
//! All other operations are forwarded unchanged to the live session; broker
//! rejections are returned to the caller.

use crate::{
    connection::{Connection, ConnectionInner},
    consumer::{dispatcher, ConsumerHandler, ConsumerMessage},
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{ConsumeOptions, EventListener, LinkEvent, QueueInfo, RawChannel, RawConnection},
};
use lapin::{
    options::{
        BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelKind {
    Regular,
    Confirm,
}

enum Session {
    Unopened,
    Open {
        raw: Arc<dyn RawChannel>,
        serial: u64,
    },
    Closed,
}

struct SessionSlot {
    session: Session,
    serial: u64,
}

struct ConsumerEntry {
    queue: String,
    handler: Arc<dyn ConsumerHandler>,
    options: ConsumeOptions,
}

struct ChannelInner {
    id: u64,
    kind: ChannelKind,
    connection: Weak<ConnectionInner>,
    slot: Mutex<SessionSlot>,
    /// Held while a session is being opened and while the registry changes,
    /// so a new session never misses a consumer.
    consumers: tokio::sync::Mutex<HashMap<String, ConsumerEntry>>,
}

impl ChannelInner {
    fn lock_slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Self-healing AMQP channel created by [`Connection::create_channel`].
///
/// Cloning is cheap; clones share the same session and consumer registry.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(id: u64, kind: ChannelKind, connection: Weak<ConnectionInner>) -> Channel {
        Channel {
            inner: Arc::new(ChannelInner {
                id,
                kind,
                connection,
                slot: Mutex::new(SessionSlot {
                    session: Session::Unopened,
                    serial: 0,
                }),
                consumers: tokio::sync::Mutex::new(HashMap::default()),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the live session, opening one if needed.
    ///
    /// A newly opened session already carries every registered consumer.
    pub async fn get_raw_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        self.session().await.map(|(raw, _)| raw)
    }

    /// Opens a session on `raw_connection` unless a live one exists.
    ///
    /// Used by the connection to restore its channels after a reconnection.
    pub(crate) async fn attach(
        &self,
        raw_connection: &Arc<dyn RawConnection>,
    ) -> Result<Arc<dyn RawChannel>, AmqpError> {
        let mut consumers = self.inner.consumers.lock().await;

        if let Some((raw, _)) = self.live_session()? {
            return Ok(raw);
        }

        self.open_session(raw_connection, &mut consumers)
            .await
            .map(|(raw, _)| raw)
    }

    async fn session(&self) -> Result<(Arc<dyn RawChannel>, u64), AmqpError> {
        if let Some(live) = self.live_session()? {
            return Ok(live);
        }

        // The connection may restore this very channel while connecting, so
        // no lock of this channel is held while waiting for it.
        let connection = self
            .inner
            .connection
            .upgrade()
            .map(Connection::from_inner)
            .ok_or(AmqpError::ConnectionDropped)?;
        let raw_connection = connection.get_raw_connection().await?;

        let mut consumers = self.inner.consumers.lock().await;
        if let Some(live) = self.live_session()? {
            return Ok(live);
        }

        self.open_session(&raw_connection, &mut consumers).await
    }

    fn live_session(&self) -> Result<Option<(Arc<dyn RawChannel>, u64)>, AmqpError> {
        match &self.inner.lock_slot().session {
            Session::Open { raw, serial } if raw.is_open() => Ok(Some((raw.clone(), *serial))),
            Session::Closed => Err(AmqpError::ChannelClosed),
            _ => Ok(None),
        }
    }

    fn is_current(&self, serial: u64) -> bool {
        matches!(
            &self.inner.lock_slot().session,
            Session::Open { raw, serial: s } if *s == serial && raw.is_open()
        )
    }

    /// Opens a new session and replays the registry onto it.
    ///
    /// A consumer the broker refuses to restore (its queue is gone, for
    /// instance) is dropped from the registry. Refusing a consumer closes the
    /// session on the broker side, in which case another session is opened
    /// for the remaining consumers. When the connection itself goes away
    /// every consumer is kept and the error is returned.
    async fn open_session(
        &self,
        raw_connection: &Arc<dyn RawConnection>,
        consumers: &mut HashMap<String, ConsumerEntry>,
    ) -> Result<(Arc<dyn RawChannel>, u64), AmqpError> {
        loop {
            let raw = match self.inner.kind {
                ChannelKind::Regular => raw_connection.create_channel().await?,
                ChannelKind::Confirm => raw_connection.create_confirm_channel().await?,
            };
            let serial = self.observe(&raw);

            let mut dropped = vec![];
            let mut connection_lost = None;
            for (tag, entry) in consumers.iter() {
                // Entries after a refused one are retried on the next session.
                if !raw.is_open() {
                    break;
                }
                let deliver = dispatcher(&entry.queue, entry.handler.clone());
                if let Err(err) = raw.basic_consume(&entry.queue, &entry.options, deliver).await {
                    // Only a refusal on a live connection removes the consumer;
                    // otherwise it is replayed after the reconnection.
                    if !raw_connection.is_open() {
                        warn!(
                            error = err.to_string(),
                            consumer_tag = tag,
                            queue = entry.queue,
                            "connection lost while restoring consumer"
                        );
                        connection_lost = Some(err);
                        break;
                    }
                    error!(
                        error = err.to_string(),
                        consumer_tag = tag,
                        queue = entry.queue,
                        "failure to restore consumer, dropping it"
                    );
                    dropped.push(tag.clone());
                }
            }
            for tag in &dropped {
                consumers.remove(tag);
            }
            if let Some(err) = connection_lost {
                return Err(err);
            }

            if !raw.is_open() {
                if dropped.is_empty() {
                    return Err(AmqpError::ChannelError("session closed while opening".to_owned()));
                }
                continue;
            }

            if !consumers.is_empty() {
                debug!(
                    channel = self.inner.id,
                    consumers = consumers.len(),
                    "consumers restored"
                );
            }

            self.inner.lock_slot().session = Session::Open {
                raw: raw.clone(),
                serial,
            };
            return Ok((raw, serial));
        }
    }

    fn observe(&self, raw: &Arc<dyn RawChannel>) -> u64 {
        let serial = {
            let mut slot = self.inner.lock_slot();
            slot.serial += 1;
            slot.serial
        };

        let weak = Arc::downgrade(&self.inner);
        let listener: EventListener = Box::new(move |event| {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            if let LinkEvent::Error(reason) = &event {
                warn!(channel = inner.id, reason, "channel error");
            }

            let mut slot = inner.lock_slot();
            if matches!(&slot.session, Session::Open { serial: s, .. } if *s == serial) {
                slot.session = Session::Unopened;
            }
        });
        raw.on_event(listener);

        serial
    }

    /// Registers `handler` for the messages of `queue`.
    ///
    /// The consumer is re-attached automatically every time the channel opens
    /// a new session. Handler failures are logged and never stop the consumer.
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `handler` - Called for every delivery, on its own task
    /// * `options` - Consumer tag, flags and arguments, reused on every replay
    ///
    /// # Returns
    /// The consumer tag, needed to [`Channel::cancel`] the consumer.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<String, AmqpError> {
        loop {
            let (raw, serial) = self.session().await?;
            let mut consumers = self.inner.consumers.lock().await;
            if !self.is_current(serial) {
                continue;
            }

            let tag = raw
                .basic_consume(queue, &options, dispatcher(queue, handler.clone()))
                .await?;

            debug!(channel = self.inner.id, queue, consumer_tag = tag, "consumer registered");
            consumers.insert(
                tag.clone(),
                ConsumerEntry {
                    queue: queue.to_owned(),
                    handler,
                    options: ConsumeOptions {
                        consumer_tag: Some(tag.clone()),
                        ..options
                    },
                },
            );
            return Ok(tag);
        }
    }

    /// Cancels a consumer and forgets it.
    pub async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        loop {
            let (raw, serial) = self.session().await?;
            let mut consumers = self.inner.consumers.lock().await;
            if !self.is_current(serial) {
                continue;
            }

            raw.basic_cancel(consumer_tag).await?;
            consumers.remove(consumer_tag);
            return Ok(());
        }
    }

    /// Closes the channel for good.
    ///
    /// The live session, if any, is closed, the consumer registry is cleared
    /// and the channel is no longer tracked by its connection. Every later
    /// operation fails with [`AmqpError::ChannelClosed`]. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let previous = {
            let mut consumers = self.inner.consumers.lock().await;
            consumers.clear();
            let mut slot = self.inner.lock_slot();
            std::mem::replace(&mut slot.session, Session::Closed)
        };

        if let Some(connection) = self.inner.connection.upgrade() {
            Connection::from_inner(connection).remove_channel(self);
        }

        match previous {
            Session::Open { raw, .. } if raw.is_open() => raw.close().await,
            _ => Ok(()),
        }
    }

    /// Declares a queue, creating it when it does not exist.
    ///
    /// # Parameters
    /// * `queue` - Queue name; empty lets the broker pick one
    /// * `options` - Durability, exclusivity and auto-delete flags
    /// * `arguments` - Queue arguments such as `x-dead-letter-exchange`
    ///
    /// # Returns
    /// The queue name with its message and consumer counts.
    pub async fn assert_queue(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.queue_declare(queue, options, arguments).await
    }

    /// Fails when the queue does not exist; the broker then closes the
    /// session, which is re-opened on next use.
    pub async fn check_queue(&self, queue: &str) -> Result<QueueInfo, AmqpError> {
        let raw = self.get_raw_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        raw.queue_declare(queue, options, FieldTable::default()).await
    }

    /// Deletes a queue and returns the number of messages it held.
    pub async fn delete_queue(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.queue_delete(queue, options).await
    }

    /// Removes every ready message of a queue and returns how many were removed.
    pub async fn purge_queue(&self, queue: &str) -> Result<u32, AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.queue_purge(queue).await
    }

    /// Routes messages published to `source` with a matching `pattern` into
    /// `queue`.
    pub async fn bind_queue(
        &self,
        queue: &str,
        source: &str,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.queue_bind(queue, source, pattern, arguments).await
    }

    /// Removes a binding made by [`Channel::bind_queue`].
    pub async fn unbind_queue(
        &self,
        queue: &str,
        source: &str,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.queue_unbind(queue, source, pattern, arguments).await
    }

    /// Declares an exchange, creating it when it does not exist.
    ///
    /// # Parameters
    /// * `exchange` - Exchange name
    /// * `kind` - Routing algorithm of the exchange
    /// * `options` - Durability, auto-delete and internal flags
    /// * `arguments` - Exchange arguments such as `alternate-exchange`
    pub async fn assert_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.exchange_declare(exchange, kind.into(), options, arguments)
            .await
    }

    /// Fails when the exchange does not exist; the broker then closes the
    /// session, which is re-opened on next use.
    pub async fn check_exchange(&self, exchange: &str) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        raw.exchange_declare(
            exchange,
            ExchangeKind::default().into(),
            options,
            FieldTable::default(),
        )
        .await
    }

    /// Deletes an exchange.
    pub async fn delete_exchange(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.exchange_delete(exchange, options).await
    }

    /// Routes messages published to `source` with a matching `pattern` into
    /// the `destination` exchange.
    pub async fn bind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.exchange_bind(destination, source, pattern, arguments)
            .await
    }

    /// Removes a binding made by [`Channel::bind_exchange`].
    pub async fn unbind_exchange(
        &self,
        destination: &str,
        source: &str,
        pattern: &str,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.exchange_unbind(destination, source, pattern, arguments)
            .await
    }

    /// Publishes a message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; empty for the default exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Message body
    /// * `options` - Mandatory and immediate flags
    /// * `properties` - Content type, headers, message id, ...
    ///
    /// # Returns
    /// Ok(()) once the message was handed to the broker. A publish to an
    /// unknown exchange fails and the session is re-opened on next use.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_publish(exchange, routing_key, options, payload, properties)
            .await
    }

    /// Publishes through the default exchange straight to `queue`.
    pub async fn send_to_queue(
        &self,
        queue: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.publish("", queue, payload, options, properties).await
    }

    /// Fetches a single message, `None` when the queue is empty.
    pub async fn get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<ConsumerMessage>, AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_get(queue, options).await
    }

    /// Acknowledges `msg`, and every earlier unacknowledged message when
    /// `all_up_to` is set.
    pub async fn ack(&self, msg: &ConsumerMessage, all_up_to: bool) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_ack(msg.delivery_tag, all_up_to).await
    }

    /// Acknowledges every outstanding message of the session.
    pub async fn ack_all(&self) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_ack(0, true).await
    }

    /// Negatively acknowledges `msg`, and every earlier unacknowledged message
    /// when `all_up_to` is set. The messages are requeued when `requeue` is set.
    pub async fn nack(
        &self,
        msg: &ConsumerMessage,
        all_up_to: bool,
        requeue: bool,
    ) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_nack(msg.delivery_tag, all_up_to, requeue).await
    }

    /// Negatively acknowledges every outstanding message of the session.
    pub async fn nack_all(&self, requeue: bool) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_nack(0, true, requeue).await
    }

    /// Rejects `msg`, requeueing it when `requeue` is set.
    pub async fn reject(&self, msg: &ConsumerMessage, requeue: bool) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_reject(msg.delivery_tag, requeue).await
    }

    /// Limits the number of unacknowledged deliveries.
    ///
    /// # Parameters
    /// * `count` - Maximum outstanding deliveries; `0` means no limit
    /// * `global` - Apply the limit to the whole session instead of per consumer
    pub async fn prefetch(&self, count: u16, global: bool) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_qos(count, global).await
    }

    /// Asks the broker to redeliver every unacknowledged message.
    pub async fn recover(&self) -> Result<(), AmqpError> {
        let raw = self.get_raw_channel().await?;
        raw.basic_recover(true).await
    }
}

/// Channel whose sessions have publisher confirms enabled, created by
/// [`Connection::create_confirm_channel`].
///
/// Every [`Channel`] operation is available through `Deref`.
#[derive(Clone)]
pub struct ConfirmChannel {
    channel: Channel,
}

impl ConfirmChannel {
    pub(crate) fn new(channel: Channel) -> ConfirmChannel {
        ConfirmChannel { channel }
    }

    /// Publishes and resolves once the broker confirmed the message; a nack
    /// is reported as [`AmqpError::ConfirmError`].
    pub async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let raw = self.channel.get_raw_channel().await?;
        raw.basic_publish_confirmed(exchange, routing_key, options, payload, properties)
            .await
    }

    /// Confirmed publish through the default exchange straight to `queue`.
    pub async fn send_to_queue_confirmed(
        &self,
        queue: &str,
        payload: &[u8],
        options: BasicPublishOptions,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.publish_confirmed("", queue, payload, options, properties)
            .await
    }

    /// Waits until every message published so far has been confirmed.
    pub async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        let raw = self.channel.get_raw_channel().await?;
        raw.wait_for_confirms().await
    }
}

impl Deref for ConfirmChannel {
    type Target = Channel;

    fn deref(&self) -> &Channel {
        &self.channel
    }
}
