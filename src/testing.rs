// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits, used by the unit tests.
//!
//! It routes publishes through the default exchange and through exact-match
//! queue bindings, and models the AMQP behaviours the resilience layer reacts
//! to: refused connections, connection loss (every session dies with it), and
//! channel-level errors that close a session.

use crate::{
    consumer::{ConsumerHandler, ConsumerMessage},
    errors::AmqpError,
    transport::{
        ConsumeOptions, DeliveryCallback, EventListener, LinkEvent, QueueInfo, RawChannel,
        RawConnection, Transport,
    },
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
        QueueDeclareOptions, QueueDeleteOptions,
    },
    types::FieldTable,
    BasicProperties,
};
use opentelemetry::Context;
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

type Listener = Arc<dyn Fn(LinkEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

struct FakeConsumer {
    tag: String,
    queue: String,
    session: Weak<FakeChannel>,
    deliver: DeliveryCallback,
}

#[derive(Default)]
struct BrokerState {
    down: bool,
    failures_left: usize,
    connections: Vec<Arc<FakeConnection>>,
    queues: HashSet<String>,
    exchanges: HashSet<String>,
    bindings: Vec<(String, String, String)>,
    consumers: Vec<FakeConsumer>,
    parked: Vec<(String, ConsumerMessage)>,
    break_connection_on_consume: Option<String>,
    published: Vec<Published>,
    next_delivery_tag: u64,
    next_tag: u64,
}

#[derive(Default)]
pub(crate) struct FakeBroker {
    state: Mutex<BrokerState>,
    connect_attempts: AtomicUsize,
    sessions_opened: AtomicUsize,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeBroker::default())
    }

    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            broker: self.clone(),
        })
    }

    /// A connection that did not go through the transport.
    pub fn raw_connection(self: &Arc<Self>) -> Arc<dyn RawConnection> {
        self.new_connection()
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.sessions_opened.load(Ordering::SeqCst)
    }

    /// Simulates the broker process dying: refuses new connections and
    /// breaks every open one.
    pub fn kill(&self) {
        let connections = {
            let mut state = self.state.lock().unwrap();
            state.down = true;
            std::mem::take(&mut state.connections)
        };
        for conn in connections {
            conn.fail("connection reset by peer");
        }
    }

    /// The next consume on `queue` breaks the connection it arrives on.
    pub fn break_connection_on_consume(&self, queue: &str) {
        self.state.lock().unwrap().break_connection_on_consume = Some(queue.to_owned());
    }

    pub fn restart(&self) {
        self.state.lock().unwrap().down = false;
    }

    pub fn latest_connection(&self) -> Option<Arc<FakeConnection>> {
        self.state.lock().unwrap().connections.last().cloned()
    }

    pub fn declare_queue(&self, queue: &str) {
        self.state.lock().unwrap().queues.insert(queue.to_owned());
    }

    pub fn drop_queue(&self, queue: &str) {
        let mut state = self.state.lock().unwrap();
        state.queues.remove(queue);
        state.consumers.retain(|c| c.queue != queue);
    }

    /// Consumers attached to `queue` on a live session.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && is_live(&c.session))
            .count()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && is_live(&c.session))
            .map(|c| c.tag.clone())
            .collect()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state.lock().unwrap().published.clone()
    }

    fn new_connection(self: &Arc<Self>) -> Arc<FakeConnection> {
        let conn = Arc::new_cyclic(|me| FakeConnection {
            me: me.clone(),
            broker: Arc::downgrade(self),
            open: AtomicBool::new(true),
            listeners: Mutex::new(vec![]),
            sessions: Mutex::new(vec![]),
        });
        self.state.lock().unwrap().connections.push(conn.clone());
        conn
    }

    fn route(&self, exchange: &str, routing_key: &str, properties: BasicProperties, data: &[u8]) {
        let targets = {
            let mut state = self.state.lock().unwrap();
            state.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties: properties.clone(),
                data: data.to_vec(),
            });

            let queues: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_owned()]
            } else {
                state
                    .bindings
                    .iter()
                    .filter(|(e, k, _)| e == exchange && k == routing_key)
                    .map(|(_, _, q)| q.clone())
                    .collect()
            };

            let mut targets = vec![];
            for queue in queues {
                state.next_delivery_tag += 1;
                let msg = ConsumerMessage {
                    consumer_tag: String::new(),
                    delivery_tag: state.next_delivery_tag,
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    properties: properties.clone(),
                    data: data.to_vec(),
                };
                let consumer = state
                    .consumers
                    .iter()
                    .find(|c| c.queue == queue && is_live(&c.session))
                    .map(|c| (c.deliver.clone(), c.tag.clone()));
                match consumer {
                    Some((deliver, tag)) => targets.push((
                        deliver,
                        ConsumerMessage {
                            consumer_tag: tag,
                            ..msg
                        },
                    )),
                    None => state.parked.push((queue, msg)),
                }
            }
            targets
        };

        for (deliver, msg) in targets {
            deliver(msg);
        }
    }
}

fn is_live(session: &Weak<FakeChannel>) -> bool {
    session
        .upgrade()
        .map(|s| s.open.load(Ordering::SeqCst))
        .unwrap_or(false)
}

struct FakeTransport {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, uri: &str) -> Result<Arc<dyn RawConnection>, AmqpError> {
        self.broker.connect_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let refused = {
            let mut state = self.broker.state.lock().unwrap();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                true
            } else {
                state.down
            }
        };

        if refused {
            return Err(AmqpError::ConnectionError(format!("{uri}: refused")));
        }

        Ok(self.broker.new_connection())
    }
}

pub(crate) struct FakeConnection {
    me: Weak<FakeConnection>,
    broker: Weak<FakeBroker>,
    open: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
    sessions: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    /// Breaks the connection: every session closes, then the connection
    /// reports an error.
    pub fn fail(&self, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for session in sessions {
            session.shutdown(None);
        }
        emit(&self.listeners, LinkEvent::Error(reason.to_owned()));
    }

    pub fn latest_session(&self) -> Option<Arc<FakeChannel>> {
        self.sessions.lock().unwrap().last().cloned()
    }

    fn open_session(&self, confirm: bool) -> Result<Arc<dyn RawChannel>, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }
        let broker = self.broker.upgrade().ok_or(AmqpError::InternalError)?;
        broker.sessions_opened.fetch_add(1, Ordering::SeqCst);

        let session = Arc::new_cyclic(|me| FakeChannel {
            me: me.clone(),
            connection: self.me.clone(),
            broker: self.broker.clone(),
            confirm,
            open: AtomicBool::new(true),
            listeners: Mutex::new(vec![]),
        });
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

fn emit(listeners: &Mutex<Vec<Listener>>, event: LinkEvent) {
    let listeners = listeners.lock().unwrap().clone();
    for listener in listeners {
        listener(event.clone());
    }
}

#[async_trait]
impl RawConnection for FakeConnection {
    async fn create_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        self.open_session(false)
    }

    async fn create_confirm_channel(&self) -> Result<Arc<dyn RawChannel>, AmqpError> {
        self.open_session(true)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners.lock().unwrap().push(Arc::from(listener));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let sessions = std::mem::take(&mut *self.sessions.lock().unwrap());
        for session in sessions {
            session.shutdown(None);
        }
        emit(&self.listeners, LinkEvent::Closed);
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    me: Weak<FakeChannel>,
    connection: Weak<FakeConnection>,
    broker: Weak<FakeBroker>,
    confirm: bool,
    open: AtomicBool,
    listeners: Mutex<Vec<Listener>>,
}

impl FakeChannel {
    /// Closes the session as the broker does after a channel-level error.
    pub fn fail(&self, reason: &str) {
        self.shutdown(Some(reason));
    }

    fn shutdown(&self, error: Option<&str>) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(reason) = error {
            emit(&self.listeners, LinkEvent::Error(reason.to_owned()));
        }
        emit(&self.listeners, LinkEvent::Closed);
    }

    fn broker(&self) -> Result<Arc<FakeBroker>, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        self.broker.upgrade().ok_or(AmqpError::InternalError)
    }
}

#[async_trait]
impl RawChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_event(&self, listener: EventListener) {
        self.listeners.lock().unwrap().push(Arc::from(listener));
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown(None);
        Ok(())
    }

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let broker = self.broker()?;
        let known = broker.state.lock().unwrap().queues.contains(queue);

        if options.passive && !known {
            self.fail("NOT_FOUND - no queue");
            return Err(AmqpError::DeclareQueueError(queue.to_owned()));
        }

        let mut state = broker.state.lock().unwrap();
        state.queues.insert(queue.to_owned());
        let message_count = state.parked.iter().filter(|(q, _)| q == queue).count() as u32;
        let consumer_count = state
            .consumers
            .iter()
            .filter(|c| c.queue == queue && is_live(&c.session))
            .count() as u32;

        Ok(QueueInfo {
            name: queue.to_owned(),
            message_count,
            consumer_count,
        })
    }

    async fn queue_delete(
        &self,
        queue: &str,
        _options: QueueDeleteOptions,
    ) -> Result<u32, AmqpError> {
        let broker = self.broker()?;
        let mut state = broker.state.lock().unwrap();
        state.queues.remove(queue);
        state.consumers.retain(|c| c.queue != queue);
        let before = state.parked.len();
        state.parked.retain(|(q, _)| q != queue);
        Ok((before - state.parked.len()) as u32)
    }

    async fn queue_purge(&self, queue: &str) -> Result<u32, AmqpError> {
        let broker = self.broker()?;
        let mut state = broker.state.lock().unwrap();
        let before = state.parked.len();
        state.parked.retain(|(q, _)| q != queue);
        Ok((before - state.parked.len()) as u32)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        broker.state.lock().unwrap().bindings.push((
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ));
        Ok(())
    }

    async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        broker
            .state
            .lock()
            .unwrap()
            .bindings
            .retain(|(e, k, q)| !(e == exchange && k == routing_key && q == queue));
        Ok(())
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        _kind: lapin::ExchangeKind,
        options: ExchangeDeclareOptions,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        let known = broker.state.lock().unwrap().exchanges.contains(exchange);

        if options.passive && !known {
            self.fail("NOT_FOUND - no exchange");
            return Err(AmqpError::DeclareExchangeError(exchange.to_owned()));
        }

        broker
            .state
            .lock()
            .unwrap()
            .exchanges
            .insert(exchange.to_owned());
        Ok(())
    }

    async fn exchange_delete(
        &self,
        exchange: &str,
        _options: ExchangeDeleteOptions,
    ) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        broker.state.lock().unwrap().exchanges.remove(exchange);
        Ok(())
    }

    async fn exchange_bind(
        &self,
        _destination: &str,
        _source: &str,
        _routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn exchange_unbind(
        &self,
        _destination: &str,
        _source: &str,
        _routing_key: &str,
        _arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        let known = exchange.is_empty() || broker.state.lock().unwrap().exchanges.contains(exchange);

        if !known {
            self.fail("NOT_FOUND - no exchange");
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        }

        broker.route(exchange, routing_key, properties, payload);
        Ok(())
    }

    async fn basic_publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        if !self.confirm {
            return Err(AmqpError::ConfirmError("not a confirm channel".to_owned()));
        }
        self.basic_publish(exchange, routing_key, options, payload, properties)
            .await
    }

    async fn basic_consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
        deliver: DeliveryCallback,
    ) -> Result<String, AmqpError> {
        let broker = self.broker()?;

        let breaks_connection = {
            let mut state = broker.state.lock().unwrap();
            let armed = state.break_connection_on_consume.as_deref() == Some(queue);
            if armed {
                state.break_connection_on_consume = None;
            }
            armed
        };
        if breaks_connection {
            if let Some(connection) = self.connection.upgrade() {
                connection.fail("connection reset by peer");
            }
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (tag, backlog) = {
            let mut state = broker.state.lock().unwrap();
            if !state.queues.contains(queue) {
                drop(state);
                self.fail("NOT_FOUND - no queue");
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            }

            let tag = match &options.consumer_tag {
                Some(tag) => tag.clone(),
                None => {
                    state.next_tag += 1;
                    format!("amq.ctag-{}", state.next_tag)
                }
            };

            state.consumers.push(FakeConsumer {
                tag: tag.clone(),
                queue: queue.to_owned(),
                session: self.me.clone(),
                deliver: deliver.clone(),
            });

            let mut backlog = VecDeque::new();
            state.parked.retain(|(q, msg)| {
                if q == queue {
                    backlog.push_back(msg.clone());
                    false
                } else {
                    true
                }
            });
            (tag, backlog)
        };

        for msg in backlog {
            deliver(ConsumerMessage {
                consumer_tag: tag.clone(),
                ..msg
            });
        }

        Ok(tag)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let broker = self.broker()?;
        broker
            .state
            .lock()
            .unwrap()
            .consumers
            .retain(|c| c.tag != consumer_tag);
        Ok(())
    }

    async fn basic_get(
        &self,
        queue: &str,
        _options: BasicGetOptions,
    ) -> Result<Option<ConsumerMessage>, AmqpError> {
        let broker = self.broker()?;
        let mut state = broker.state.lock().unwrap();
        let position = state.parked.iter().position(|(q, _)| q == queue);
        Ok(position.map(|index| state.parked.remove(index).1))
    }

    async fn basic_ack(&self, _delivery_tag: u64, _multiple: bool) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn basic_nack(
        &self,
        _delivery_tag: u64,
        _multiple: bool,
        _requeue: bool,
    ) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn basic_reject(&self, _delivery_tag: u64, _requeue: bool) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn basic_qos(&self, _prefetch_count: u16, _global: bool) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn basic_recover(&self, _requeue: bool) -> Result<(), AmqpError> {
        self.broker().map(|_| ())
    }

    async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        self.broker()?;
        if self.confirm {
            Ok(())
        } else {
            Err(AmqpError::ConfirmError("not a confirm channel".to_owned()))
        }
    }
}

/// Handler recording every payload it receives; payloads equal to `"fail"`
/// make it return an error.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    received: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHandler::default())
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConsumerHandler for RecordingHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        let body = String::from_utf8_lossy(&msg.data).to_string();
        self.received.lock().unwrap().push(body.clone());

        if body == "fail" {
            return Err(AmqpError::ConsumerError(body));
        }
        Ok(())
    }
}

/// Lets spawned tasks (deliveries, scheduled reconnects) make progress.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
