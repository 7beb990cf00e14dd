//! In-memory broker for tests.
//!
//! Counts every connection attempt, channel open, declaration and publish, and
//! can be told to fail or stall each step.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ConnectParams, Endpoint,
};

/// A message the mock broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
}

#[derive(Default)]
struct BrokerState {
    connect_attempts: AtomicU32,
    channel_opens: AtomicU32,
    fail_connect: AtomicBool,
    fail_channel: AtomicBool,
    fail_publish: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    endpoints: Mutex<Vec<Endpoint>>,
    declared: Mutex<Vec<(String, bool)>>,
    published: Mutex<Vec<PublishedMessage>>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A broker that refuses every connection
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.set_fail_connect(true);
        broker
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_channel(&self, fail: bool) {
        self.state.fail_channel.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Make every publish sleep this long before confirming
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        *self.state.publish_delay.lock() = delay;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn channel_opens(&self) -> u32 {
        self.state.channel_opens.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.endpoints.lock().clone()
    }

    pub fn declared(&self) -> Vec<(String, bool)> {
        self.state.declared.lock().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Bodies published to `queue` through the default exchange
    pub fn published_to(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .published
            .lock()
            .iter()
            .filter(|m| m.exchange.is_empty() && m.routing_key == queue)
            .map(|m| m.body.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.state.endpoints.lock().push(params.endpoint.clone());

        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(BrokerError::Connect(format!(
                "connection refused by {}",
                params.endpoint
            )));
        }
        Ok(Arc::new(MemoryConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryConnection {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.state.channel_opens.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_channel.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel limit reached".into()));
        }
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.state.declared.lock().push((name.to_string(), durable));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        let delay = *self.state.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(BrokerError::Nack);
        }

        self.state.published.lock().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            persistent,
        });
        Ok(())
    }
}
