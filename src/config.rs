// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Configuration
//!
//! Broker coordinates and the retry policy applied to both the initial
//! connection and every reconnection after a loss. The configuration can be
//! embedded in an application's own serde configuration or loaded from
//! `RABBITMQ_*` environment variables.

use crate::errors::AmqpError;
use ::config::{Config, Environment};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Prefix of the environment variables read by [`RabbitMQConfigs::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// Default number of additional attempts after the first failed connect.
pub const DEFAULT_RETRIES: u32 = 5;
/// Default pause between two connect attempts, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5000;

/// Bounded retry policy for connection attempts.
///
/// A connect performs `max_retries + 1` attempts separated by `retry_delay`.
/// The same delay is used before a reconnection is started after a loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        RetryPolicy {
            max_retries,
            retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: DEFAULT_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RabbitMQConfigs {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_credential")]
    pub user: String,
    #[serde(default = "default_credential")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    /// Name reported to the broker, visible in the management UI
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_credential() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    DEFAULT_RETRY_DELAY_MS
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: default_host(),
            port: default_port(),
            user: default_credential(),
            password: default_credential(),
            vhost: default_vhost(),
            connection_name: None,
            retries: DEFAULT_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads the settings from `RABBITMQ_HOST`, `RABBITMQ_PORT`,
    /// `RABBITMQ_USER`, `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST`,
    /// `RABBITMQ_CONNECTION_NAME`, `RABBITMQ_RETRIES` and
    /// `RABBITMQ_RETRY_DELAY_MS`.
    ///
    /// # Returns
    /// The settings, with defaults for every missing variable, or
    /// `AmqpError::ConfigError` when a variable holds a value of the wrong type.
    pub fn from_env() -> Result<Self, AmqpError> {
        Self::from_environment(Environment::with_prefix(ENV_PREFIX))
    }

    fn from_environment(source: Environment) -> Result<Self, AmqpError> {
        Config::builder()
            .add_source(source.try_parsing(true))
            .build()
            .and_then(|cfg| cfg.try_deserialize())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load rabbitmq configs");
                AmqpError::ConfigError(err.to_string())
            })
    }

    /// Builds the `amqp://` URI for these settings.
    ///
    /// The default vhost `/` is percent-encoded as the AMQP URI scheme requires.
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "/" => "%2f",
            other => other.trim_start_matches('/'),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_millis(self.retry_delay_ms))
    }
}
