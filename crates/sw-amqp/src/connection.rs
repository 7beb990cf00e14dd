//! Connection Manager
//!
//! Owns the single connection and channel of one client. Each handle is
//! attempted once through the breaker; a failed attempt is cached as
//! [`HandleState::Failed`] and stays that way until [`ConnectionManager::reset`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use sw_breaker::{Action, CallFailure, CircuitBreaker, Invocation, Provider};
use sw_common::{codes, ErrorRequest, LastError, Severity};
use sw_config::AmqpConfig;

use crate::error::ConnectionError;
use crate::transport::{
    select_endpoint, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ConnectParams,
};

/// Lifecycle of a broker handle.
pub enum HandleState<H> {
    Uninitialized,
    Failed,
    Ready(H),
}

impl<H> HandleState<H> {
    pub fn is_failed(&self) -> bool {
        matches!(self, HandleState::Failed)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, HandleState::Ready(_))
    }
}

pub struct ConnectionManager {
    config: AmqpConfig,
    connector: Arc<dyn BrokerConnector>,
    breaker: Arc<CircuitBreaker>,
    pub(crate) last_error: Arc<LastError>,
    connection: Mutex<HandleState<Arc<dyn BrokerConnection>>>,
    channel: Mutex<HandleState<Arc<dyn BrokerChannel>>>,
    declared: Mutex<HashSet<String>>,
}

impl ConnectionManager {
    pub fn new(
        config: AmqpConfig,
        connector: Arc<dyn BrokerConnector>,
        breaker: Arc<CircuitBreaker>,
        last_error: Arc<LastError>,
    ) -> Self {
        Self {
            config,
            connector,
            breaker,
            last_error,
            connection: Mutex::new(HandleState::Uninitialized),
            channel: Mutex::new(HandleState::Uninitialized),
            declared: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// Cached connection, or one attempt if none was made yet.
    pub async fn connect<P>(&self, provider: &P) -> Option<Arc<dyn BrokerConnection>>
    where
        P: Provider + ?Sized,
        P::Args: Default,
    {
        let mut state = self.connection.lock().await;
        match &*state {
            HandleState::Ready(connection) => return Some(Arc::clone(connection)),
            HandleState::Failed => return None,
            HandleState::Uninitialized => {}
        }

        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let Some(endpoint) = select_endpoint(&self.config.hosts, self.config.port, now_millis) else {
            self.record_failure(ConnectionError::NoEndpoint(self.config.hosts.clone()));
            *state = HandleState::Failed;
            return None;
        };

        debug!(endpoint = %endpoint, "Establishing AMQP connection");
        let params = ConnectParams::new(&self.config, endpoint);
        let action = Action::establish_connection();
        let args = P::Args::default();

        let outcome = self
            .breaker
            .invoke(provider, &action, &args, self.connector.connect(&params))
            .await;

        match settle(outcome, &action) {
            Ok(connection) => {
                info!(endpoint = %params.endpoint, "AMQP connection ready");
                *state = HandleState::Ready(Arc::clone(&connection));
                Some(connection)
            }
            Err(e) => {
                self.record_failure(e);
                *state = HandleState::Failed;
                None
            }
        }
    }

    /// Cached channel on the cached connection, or one attempt.
    pub async fn channel<P>(&self, provider: &P) -> Option<Arc<dyn BrokerChannel>>
    where
        P: Provider + ?Sized,
        P::Args: Default,
    {
        let mut state = self.channel.lock().await;
        match &*state {
            HandleState::Ready(channel) => return Some(Arc::clone(channel)),
            HandleState::Failed => return None,
            HandleState::Uninitialized => {}
        }

        let Some(connection) = self.connect(provider).await else {
            *state = HandleState::Failed;
            return None;
        };

        let action = Action::open_channel();
        let args = P::Args::default();
        let outcome = self
            .breaker
            .invoke(provider, &action, &args, connection.open_channel())
            .await;

        match settle(outcome, &action) {
            Ok(channel) => {
                *state = HandleState::Ready(Arc::clone(&channel));
                Some(channel)
            }
            Err(e) => {
                self.record_failure(e);
                *state = HandleState::Failed;
                None
            }
        }
    }

    /// Declare `name` durable on `channel`, once per channel lifetime.
    pub async fn declare_queue(
        &self,
        channel: &dyn BrokerChannel,
        name: &str,
    ) -> Result<(), BrokerError> {
        let mut declared = self.declared.lock().await;
        if declared.contains(name) {
            return Ok(());
        }

        channel.declare_queue(name, true).await?;
        declared.insert(name.to_string());
        debug!(queue = %name, "Queue declared");
        Ok(())
    }

    /// Drop both handles and the declared-queue cache.
    pub async fn reset(&self) {
        let mut channel = self.channel.lock().await;
        let mut connection = self.connection.lock().await;
        *channel = HandleState::Uninitialized;
        *connection = HandleState::Uninitialized;
        self.declared.lock().await.clear();
        info!("AMQP connection state reset");
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.lock().await.is_ready()
    }

    pub async fn is_failed(&self) -> bool {
        let channel_failed = self.channel.lock().await.is_failed();
        channel_failed || self.connection.lock().await.is_failed()
    }

    fn record_failure(&self, error: ConnectionError) {
        warn!(error = %error, "AMQP handle unavailable");
        self.last_error.set_last_error(
            ErrorRequest::new(codes::AMQP_CONNECT)
                .message("broker connection unavailable")
                .level(Severity::Error)
                .cause(error),
        );
    }
}

fn settle<T, F>(
    outcome: Invocation<T, BrokerError, F>,
    action: &Action,
) -> Result<T, ConnectionError> {
    match outcome {
        Invocation::Completed(handle) => Ok(handle),
        Invocation::Failed(CallFailure::Error(e)) => Err(e.into()),
        Invocation::Failed(CallFailure::TimedOut(budget)) => Err(ConnectionError::TimedOut {
            action: action.label(),
            budget,
        }),
        Invocation::Denied(_) => Err(ConnectionError::Denied(action.label())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryBroker;
    use async_trait::async_trait;
    use sw_breaker::{BreakerSettings, Participation};

    struct TestProvider;

    #[async_trait]
    impl Provider for TestProvider {
        type Args = ();
        type Fallback = ();

        fn participation(&self, _action: &Action, _args: &()) -> Participation {
            Participation::DefaultBudget
        }

        async fn on_denied(&self, _action: &Action, _args: &()) {}
    }

    fn manager(broker: &MemoryBroker, hosts: &[&str]) -> ConnectionManager {
        let config = AmqpConfig {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        };
        ConnectionManager::new(
            config,
            Arc::new(broker.clone()),
            Arc::new(CircuitBreaker::new("amqp", BreakerSettings::default())),
            Arc::new(LastError::default()),
        )
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_retried() {
        let broker = MemoryBroker::unreachable();
        let manager = manager(&broker, &["127.0.0.1"]);

        assert!(manager.connect(&TestProvider).await.is_none());
        broker.set_fail_connect(false);
        assert!(manager.connect(&TestProvider).await.is_none());

        assert_eq!(broker.connect_attempts(), 1);
        assert!(manager.is_failed().await);
        let err = manager.last_error.last_error().unwrap();
        assert_eq!(err.code, codes::AMQP_CONNECT);
    }

    #[tokio::test]
    async fn test_reset_allows_new_attempt() {
        let broker = MemoryBroker::unreachable();
        let manager = manager(&broker, &["127.0.0.1"]);
        assert!(manager.channel(&TestProvider).await.is_none());

        broker.set_fail_connect(false);
        manager.reset().await;

        assert!(manager.channel(&TestProvider).await.is_some());
        assert!(manager.is_connected().await);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_handles_are_cached() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, &["127.0.0.1"]);

        for _ in 0..3 {
            assert!(manager.channel(&TestProvider).await.is_some());
        }
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.channel_opens(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_callers_share_one_attempt() {
        let broker = MemoryBroker::new();
        let manager = Arc::new(manager(&broker, &["127.0.0.1"]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.connect(&TestProvider).await.is_some() })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_queue_declared_once() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, &["127.0.0.1"]);
        let channel = manager.channel(&TestProvider).await.unwrap();

        manager.declare_queue(channel.as_ref(), "orders").await.unwrap();
        manager.declare_queue(channel.as_ref(), "orders").await.unwrap();
        manager.declare_queue(channel.as_ref(), "mail").await.unwrap();

        assert_eq!(
            broker.declared(),
            vec![("orders".to_string(), true), ("mail".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_unparseable_host_fails_without_attempt() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, &["amqp://:5672"]);

        assert!(manager.connect(&TestProvider).await.is_none());
        assert_eq!(broker.connect_attempts(), 0);
    }
}
