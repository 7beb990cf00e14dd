//! Broker transport seam
//!
//! The client talks to the broker only through these traits. The production
//! implementation is [`crate::lapin_transport::LapinConnector`]; tests use
//! [`crate::mock::MemoryBroker`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use sw_config::AmqpConfig;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("AMQP connection failed: {0}")]
    Connect(String),

    #[error("Failed to create channel: {0}")]
    Channel(String),

    #[error("Failed to declare queue {queue}: {reason}")]
    Declare { queue: String, reason: String },

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker rejected the message")]
    Nack,
}

/// One broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `amqp://[user@]host[:port][/vhost]` or a bare `host[:port]`.
    pub fn parse(entry: &str, default_port: u16) -> Option<Self> {
        let entry = entry.trim();
        let rest = entry
            .strip_prefix("amqp://")
            .or_else(|| entry.strip_prefix("amqps://"))
            .unwrap_or(entry);
        let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
        let authority = rest.split('/').next().unwrap_or("");

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().ok()?),
            None => (authority, default_port),
        };
        if host.is_empty() {
            return None;
        }

        Some(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Pick one of `hosts` by `now_millis % hosts.len()`.
///
/// Deterministic for a given instant but rotates across calls, spreading
/// clients over the cluster. Unparseable entries yield `None`.
pub fn select_endpoint(hosts: &[String], default_port: u16, now_millis: u128) -> Option<Endpoint> {
    if hosts.is_empty() {
        return None;
    }
    let index = (now_millis % hosts.len() as u128) as usize;
    Endpoint::parse(&hosts[index], default_port)
}

/// Everything a connector needs for one connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub endpoint: Endpoint,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_timeout_ms: u64,
    pub read_write_timeout_ms: u64,
    pub heartbeat_secs: u16,
    pub connection_name: String,
}

impl ConnectParams {
    pub fn new(config: &AmqpConfig, endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            user: config.user.clone(),
            password: config.password.clone(),
            vhost: config.vhost.clone(),
            connection_timeout_ms: config.connection_timeout_ms,
            read_write_timeout_ms: config.read_write_timeout_ms,
            heartbeat_secs: config.heartbeat_secs,
            connection_name: config.connection_name.clone(),
        }
    }

    /// AMQP URI for this attempt, credentials and vhost percent-encoded
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.endpoint.host,
            self.endpoint.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat_secs,
            self.connection_timeout_ms
        )
    }
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Publish and wait for the broker's confirm
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError>;
}
