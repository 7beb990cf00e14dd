//! Spillway AMQP publishing
//!
//! - [`ConnectionManager`]: one cached connection and channel per client
//! - [`AmqpClient`]: breaker-guarded publish with dump fallback
//! - [`JobService`]: bool-returning publish API and recovery hook

pub mod client;
pub mod connection;
pub mod error;
pub mod service;
pub mod transport;

#[cfg(feature = "lapin")]
pub mod lapin_transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{breaker_settings, sink_config, AmqpClient, Budgets, CallArgs, Fallback};
pub use connection::{ConnectionManager, HandleState};
pub use error::{ClientError, ConnectionError, PublishError};
pub use service::JobService;
pub use transport::{
    select_endpoint, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ConnectParams,
    Endpoint,
};

#[cfg(feature = "lapin")]
pub use lapin_transport::LapinConnector;
