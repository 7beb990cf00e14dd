use std::time::Duration;
use thiserror::Error;

use sw_common::SerializationError;
use sw_dump::DumpError;

use crate::transport::BrokerError;

/// Connection or channel could not be established.
///
/// Never returned to callers; it only ends up in the last-error slot.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{action} timed out after {budget:?}")]
    TimedOut { action: String, budget: Duration },

    #[error("{0} denied by circuit breaker")]
    Denied(String),

    #[error("No usable broker endpoint in {0:?}")]
    NoEndpoint(Vec<String>),
}

/// An admitted publish failed, or no publish could be attempted.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("publish to {queue} timed out after {budget:?}")]
    TimedOut { queue: String, budget: Duration },

    #[error("publish to {0} denied by circuit breaker")]
    Denied(String),

    #[error("No channel available")]
    Unavailable,
}

/// Failure of [`crate::AmqpClient::publish`]: nothing was delivered and nothing was dumped.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("Dump failed: {0}")]
    Dump(#[from] DumpError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
