// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connector
//!
//! A single bounded-retry attempt at opening a raw connection. No state is
//! kept between two calls.

use crate::{
    config::RetryPolicy,
    errors::AmqpError,
    transport::{RawConnection, Transport},
};
use backon::{ConstantBuilder, Retryable};
use std::{sync::Arc, time::Duration};
use tracing::{error, info};

/// Opens a raw connection to `uri`, retrying on failure.
///
/// At most `policy.max_retries + 1` attempts are made, separated by
/// `policy.retry_delay`. When all of them fail the error names the endpoint
/// with its credentials removed.
///
/// # Parameters
/// * `transport` - Client used for each connection attempt
/// * `uri` - AMQP URI of the broker, credentials included
/// * `policy` - Number of retries and pause between attempts
///
/// # Returns
/// The first raw connection opened, or `AmqpError::ConnectionError(endpoint)`
/// once every attempt failed.
pub async fn connect(
    transport: &dyn Transport,
    uri: &str,
    policy: &RetryPolicy,
) -> Result<Arc<dyn RawConnection>, AmqpError> {
    let endpoint = endpoint(uri);
    let backoff = ConstantBuilder::default()
        .with_delay(policy.retry_delay)
        .with_max_times(policy.max_retries as usize);

    let mut failures: u32 = 0;
    let result = (|| transport.open(uri))
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|err: &AmqpError, delay: Duration| {
            failures = failures.saturating_add(1);
            info!(
                endpoint,
                attempt = failures,
                error = err.to_string(),
                "failure to connect, retrying in {:?}",
                delay
            );
        })
        .await;

    match result {
        Ok(conn) => {
            info!(endpoint, "connection to amqp host successful");
            Ok(conn)
        }
        Err(err) => {
            error!(
                endpoint,
                retries = policy.max_retries,
                error = err.to_string(),
                "could not connect to amqp host"
            );
            Err(AmqpError::ConnectionError(endpoint))
        }
    }
}

/// The URI without its user info, safe to log.
pub(crate) fn endpoint(uri: &str) -> String {
    match (uri.find("://"), uri.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}{}", &uri[..scheme + 3], &uri[at + 1..])
        }
        _ => uri.to_owned(),
    }
}
