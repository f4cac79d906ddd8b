// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient AMQP Connection
//!
//! A [`Connection`] owns at most one live raw connection to the broker. The raw
//! connection is opened lazily by the first caller that needs it; callers
//! arriving while it is being opened join the same attempt and receive the
//! same outcome.
//!
//! When the broker reports an error on the raw connection the cached handle is
//! dropped and a single reconnection is scheduled after the retry delay. Every
//! time a new raw connection is established, each channel created from this
//! connection re-opens its session and re-attaches its consumers before the
//! new connection is handed to anyone. If a scheduled reconnection exhausts
//! its retries, the loss handler is called and no further attempt is made
//! until a caller asks for the connection again.

use crate::{
    channel::{Channel, ChannelKind, ConfirmChannel},
    config::{RabbitMQConfigs, RetryPolicy},
    connector,
    errors::AmqpError,
    lapin_transport::LapinTransport,
    transport::{LinkEvent, RawConnection, Transport},
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::{runtime::Handle, task::AbortHandle};
use tracing::{debug, error, info, warn};

/// Callback invoked when a scheduled reconnection gives up.
pub type LossHandler = Arc<dyn Fn(AmqpError) + Send + Sync>;

type PendingConnect = Shared<BoxFuture<'static, Result<Arc<dyn RawConnection>, AmqpError>>>;

enum Link {
    Disconnected,
    Connecting(PendingConnect),
    Connected {
        raw: Arc<dyn RawConnection>,
        serial: u64,
    },
}

struct ConnectionState {
    link: Link,
    /// Bumped by `close()`; work started under an older epoch is abandoned.
    epoch: u64,
    /// Serial of the most recently observed raw connection.
    serial: u64,
    reconnect_scheduled: bool,
    /// Reconnection tasks, pending or running; aborted by `close()`.
    reconnects: Vec<AbortHandle>,
    channels: HashMap<u64, Channel>,
}

pub(crate) struct ConnectionInner {
    uri: String,
    endpoint: String,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    loss_handler: Option<LossHandler>,
    next_channel_id: AtomicU64,
    state: Mutex<ConnectionState>,
}

impl ConnectionInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    uri: String,
    policy: RetryPolicy,
    transport: Option<Arc<dyn Transport>>,
    connection_name: Option<String>,
    loss_handler: Option<LossHandler>,
}

impl ConnectionBuilder {
    /// Sets the retry policy used for the initial connection and reconnections.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `transport` instead of the default lapin transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Name reported to the broker by the default lapin transport.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    /// Registers the callback invoked when a reconnection exhausts its retries.
    pub fn on_connection_loss<F>(mut self, handler: F) -> Self
    where
        F: Fn(AmqpError) + Send + Sync + 'static,
    {
        self.loss_handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Connection {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(LapinTransport::new(self.connection_name.as_deref())),
        };

        Connection {
            inner: Arc::new(ConnectionInner {
                endpoint: connector::endpoint(&self.uri),
                uri: self.uri,
                transport,
                policy: self.policy,
                loss_handler: self.loss_handler,
                next_channel_id: AtomicU64::new(1),
                state: Mutex::new(ConnectionState {
                    link: Link::Disconnected,
                    epoch: 0,
                    serial: 0,
                    reconnect_scheduled: false,
                    reconnects: vec![],
                    channels: HashMap::default(),
                }),
            }),
        }
    }
}

/// Self-healing connection to a broker endpoint.
///
/// Cloning is cheap; clones share the same raw connection and channel set.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn builder(uri: &str) -> ConnectionBuilder {
        ConnectionBuilder {
            uri: uri.to_owned(),
            policy: RetryPolicy::default(),
            transport: None,
            connection_name: None,
            loss_handler: None,
        }
    }

    /// Creates a connection with the default lapin transport and retry policy.
    pub fn new(uri: &str) -> Connection {
        Connection::builder(uri).build()
    }

    pub fn from_configs(cfg: &RabbitMQConfigs) -> Connection {
        let builder = Connection::builder(&cfg.uri()).retry_policy(cfg.retry_policy());

        match &cfg.connection_name {
            Some(name) => builder.connection_name(name).build(),
            None => builder.build(),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Connection {
        Connection { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Returns the live raw connection, establishing it if needed.
    ///
    /// Concurrent callers share a single connection attempt. A freshly
    /// established connection is only returned once every channel of this
    /// connection has re-opened its session and re-attached its consumers.
    pub async fn get_raw_connection(&self) -> Result<Arc<dyn RawConnection>, AmqpError> {
        let pending = {
            let mut state = self.inner.lock_state();

            if let Link::Connected { raw, .. } = &state.link {
                if raw.is_open() {
                    return Ok(raw.clone());
                }
            }

            let joined = match &state.link {
                Link::Connecting(pending) => Some(pending.clone()),
                _ => None,
            };

            match joined {
                Some(pending) => pending,
                None => {
                    let pending = Self::establish(self.inner.clone(), state.epoch)
                        .boxed()
                        .shared();
                    state.link = Link::Connecting(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Creates a channel bound to this connection. No session is opened until
    /// the channel is first used.
    pub fn create_channel(&self) -> Channel {
        self.register(ChannelKind::Regular)
    }

    /// Creates a channel whose sessions have publisher confirms enabled.
    pub fn create_confirm_channel(&self) -> ConfirmChannel {
        ConfirmChannel::new(self.register(ChannelKind::Confirm))
    }

    /// Stops tracking `channel`. Calling it for an untracked channel is a no-op.
    pub fn remove_channel(&self, channel: &Channel) {
        self.inner.lock_state().channels.remove(&channel.id());
    }

    /// Closes every channel of this connection and the raw connection.
    ///
    /// Any scheduled or running reconnection is aborted and will not call
    /// the loss handler. The connection can be used again afterwards: the
    /// next request opens a new raw connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let (raw, channels) = {
            let mut state = self.inner.lock_state();
            state.epoch += 1;
            state.reconnect_scheduled = false;
            for task in state.reconnects.drain(..) {
                task.abort();
            }

            let raw = match std::mem::replace(&mut state.link, Link::Disconnected) {
                Link::Connected { raw, .. } => Some(raw),
                _ => None,
            };
            let channels: Vec<Channel> = state.channels.drain().map(|(_, c)| c).collect();
            (raw, channels)
        };

        for channel in channels {
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }

        match raw {
            Some(raw) if raw.is_open() => {
                debug!(endpoint = self.inner.endpoint, "closing amqp connection");
                raw.close().await
            }
            _ => Ok(()),
        }
    }

    /// Number of channels currently tracked by this connection.
    pub fn channel_count(&self) -> usize {
        self.inner.lock_state().channels.len()
    }

    pub fn is_connected(&self) -> bool {
        matches!(&self.inner.lock_state().link, Link::Connected { raw, .. } if raw.is_open())
    }

    fn register(&self, kind: ChannelKind) -> Channel {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let channel = Channel::new(id, kind, self.downgrade());

        self.inner.lock_state().channels.insert(id, channel.clone());
        channel
    }

    /// Connects, observes the new raw connection, replays every channel and
    /// caches the handle.
    async fn establish(
        inner: Arc<ConnectionInner>,
        epoch: u64,
    ) -> Result<Arc<dyn RawConnection>, AmqpError> {
        let raw = match connector::connect(inner.transport.as_ref(), &inner.uri, &inner.policy).await
        {
            Ok(raw) => raw,
            Err(err) => {
                let mut state = inner.lock_state();
                if state.epoch == epoch {
                    state.link = Link::Disconnected;
                }
                return Err(err);
            }
        };

        let serial = Self::observe(&inner, &raw, epoch);

        let channels: Vec<Channel> = inner.lock_state().channels.values().cloned().collect();
        if !channels.is_empty() {
            debug!(channels = channels.len(), "restoring channels");
        }
        for channel in channels {
            if let Err(err) = channel.attach(&raw).await {
                warn!(
                    error = err.to_string(),
                    channel = channel.id(),
                    "failure to restore channel"
                );
            }
        }

        let current = {
            let mut state = inner.lock_state();
            if state.epoch == epoch {
                state.link = Link::Connected {
                    raw: raw.clone(),
                    serial,
                };
                true
            } else {
                false
            }
        };

        if !current {
            debug!("connection closed while connecting, dropping the new link");
            if let Err(err) = raw.close().await {
                warn!(error = err.to_string(), "failure to close abandoned connection");
            }
            return Err(AmqpError::ConnectionClosed);
        }

        Ok(raw)
    }

    fn observe(inner: &Arc<ConnectionInner>, raw: &Arc<dyn RawConnection>, epoch: u64) -> u64 {
        let serial = {
            let mut state = inner.lock_state();
            state.serial += 1;
            state.serial
        };

        let weak = Arc::downgrade(inner);
        let runtime = Handle::current();
        raw.on_event(Box::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                Connection::on_link_event(inner, &runtime, epoch, serial, event);
            }
        }));

        serial
    }

    fn on_link_event(
        inner: Arc<ConnectionInner>,
        runtime: &Handle,
        epoch: u64,
        serial: u64,
        event: LinkEvent,
    ) {
        let mut state = inner.lock_state();
        if state.epoch != epoch || state.serial != serial {
            return;
        }

        if matches!(&state.link, Link::Connected { serial: s, .. } if *s == serial) {
            state.link = Link::Disconnected;
        }

        match &event {
            LinkEvent::Error(reason) => {
                warn!(
                    endpoint = inner.endpoint,
                    reason, "amqp connection closed unexpectedly"
                );
                if !std::mem::replace(&mut state.reconnect_scheduled, true) {
                    state.reconnects.retain(|task| !task.is_finished());
                    let task = runtime.spawn(Self::reconnect(inner.clone(), epoch));
                    state.reconnects.push(task.abort_handle());
                }
            }
            LinkEvent::Closed => {
                info!(endpoint = inner.endpoint, "amqp connection closed");
            }
        }
    }

    async fn reconnect(inner: Arc<ConnectionInner>, epoch: u64) {
        tokio::time::sleep(inner.policy.retry_delay).await;

        {
            let mut state = inner.lock_state();
            if state.epoch != epoch {
                debug!("connection was closed, reconnection abandoned");
                return;
            }
            state.reconnect_scheduled = false;
        }

        info!(endpoint = inner.endpoint, "reconnecting to amqp host");
        let connection = Connection::from_inner(inner);

        if let Err(err) = connection.get_raw_connection().await {
            if connection.inner.lock_state().epoch != epoch {
                debug!("connection was closed, reconnection abandoned");
                return;
            }
            error!(
                endpoint = connection.inner.endpoint,
                error = err.to_string(),
                "reconnection failed, giving up"
            );
            if let Some(handler) = &connection.inner.loss_handler {
                handler(err);
            }
        }
    }
}
