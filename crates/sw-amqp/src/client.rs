//! Publishing Client
//!
//! Publishes jobs through the breaker. When a publish is denied, fails, or has
//! no channel, the encoded job goes to the dumper instead so nothing is lost.
//! [`AmqpClient::publish_direct`] is the replay path: same breaker, no dump.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use sw_breaker::{
    Action, ActionKind, BreakerSettings, CallFailure, CircuitBreaker, Invocation, Participation,
    Provider,
};
use sw_common::{
    codes, Delivery, DumpedRecord, ErrorRequest, ErrorSinkConfig, Job, JobType, LastError,
    Severity,
};
use sw_config::{AmqpConfig, AppConfig, BreakerConfig, ErrorsConfig};
use sw_dump::{DumpError, DumpRequest, Dumper, Republisher};

use crate::connection::ConnectionManager;
use crate::error::{ClientError, PublishError, Result};
use crate::transport::{BrokerChannel, BrokerConnector};

/// Breaker settings from the `[breaker]` config table
pub fn breaker_settings(config: &BreakerConfig) -> BreakerSettings {
    BreakerSettings {
        failure_threshold: config.failure_threshold,
        cooldown: Duration::from_millis(config.cooldown_ms),
        probe_openness: config.probe_openness,
        ramp: Duration::from_millis(config.ramp_ms),
        default_timeout: Duration::from_millis(config.default_timeout_ms),
    }
}

/// Last-error sink settings from the `[errors]` config table
pub fn sink_config(config: &ErrorsConfig) -> ErrorSinkConfig {
    ErrorSinkConfig {
        log_threshold: Severity::from_str(&config.log_threshold).unwrap_or(Severity::Notice),
        production: config.is_production(),
        log_disabled: config.log_disabled,
    }
}

/// Per-action time budgets. A zero budget falls back to the breaker default.
#[derive(Debug, Clone, Copy)]
pub struct Budgets {
    pub connect: Duration,
    pub channel: Duration,
    pub publish: Duration,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            connect: Duration::from_millis(1000),
            channel: Duration::from_millis(1000),
            publish: Duration::from_millis(1000),
        }
    }
}

impl From<&BreakerConfig> for Budgets {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_timeout_ms),
            channel: Duration::from_millis(config.channel_timeout_ms),
            publish: Duration::from_millis(config.publish_timeout_ms),
        }
    }
}

/// Arguments the breaker hands back to the client's policy hooks.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    /// What to dump if the call is denied; `None` on the replay path
    pub dump: Option<DumpRequest>,
}

/// What the client does when the breaker denies a call.
#[derive(Debug)]
pub enum Fallback {
    /// Nothing to dump
    Unavailable,
    Dumped(std::result::Result<i64, DumpError>),
}

pub struct AmqpClient {
    connection: ConnectionManager,
    breaker: Arc<CircuitBreaker>,
    dumper: Option<Arc<dyn Dumper>>,
    budgets: Budgets,
    last_error: Arc<LastError>,
    monitored: bool,
}

impl AmqpClient {
    pub fn new(
        config: AmqpConfig,
        connector: Arc<dyn BrokerConnector>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        let last_error = Arc::new(LastError::default());
        Self {
            connection: ConnectionManager::new(
                config,
                connector,
                Arc::clone(&breaker),
                Arc::clone(&last_error),
            ),
            breaker,
            dumper: None,
            budgets: Budgets::default(),
            last_error,
            monitored: true,
        }
    }

    /// Client wired from the full application config, with its own breaker.
    pub fn from_config(config: &AppConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new("amqp", breaker_settings(&config.breaker)));
        Self::new(config.amqp.clone(), connector, breaker)
            .with_budgets(Budgets::from(&config.breaker))
            .with_last_error(Arc::new(LastError::new(sink_config(&config.errors))))
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn Dumper>) -> Self {
        self.dumper = Some(dumper);
        self
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_last_error(mut self, last_error: Arc<LastError>) -> Self {
        self.connection.last_error = Arc::clone(&last_error);
        self.last_error = last_error;
        self
    }

    /// Unmonitored clients call the broker without breaker state tracking.
    pub fn with_monitoring(mut self, monitored: bool) -> Self {
        self.monitored = monitored;
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn last_error(&self) -> &Arc<LastError> {
        &self.last_error
    }

    /// Publish `job` to its queue, dumping it when the broker cannot take it.
    ///
    /// `Ok(Delivery::Dumped)` means the job is safe in the dump store. An
    /// `Err` means it is neither delivered nor dumped.
    pub async fn publish(&self, job: &Job) -> Result<Delivery> {
        let body = job.encode().map_err(|e| {
            let err = ClientError::Serialization(e);
            self.last_error.set_last_error(
                ErrorRequest::new(codes::SERIALIZATION)
                    .message(format!("job {} could not be encoded", job.id))
                    .level(Severity::Error)
                    .developer_message(err.to_string()),
            );
            err
        })?;

        self.publish_encoded(&job.queue, body, job.job_type(), job.persistent)
            .await
    }

    /// Publish an already encoded body as a persistent message.
    pub async fn publish_body(
        &self,
        queue: &str,
        body: Vec<u8>,
        job_type: JobType,
    ) -> Result<Delivery> {
        self.publish_encoded(queue, body, job_type, true).await
    }

    async fn publish_encoded(
        &self,
        queue: &str,
        body: Vec<u8>,
        job_type: JobType,
        persistent: bool,
    ) -> Result<Delivery> {
        let args = CallArgs {
            dump: Some(DumpRequest::new(queue, body, job_type).with_persistent(persistent)),
        };

        let outcome = match self.connection.channel(self).await {
            Some(channel) => {
                let body = args.dump.as_ref().map(|r| r.payload.as_slice()).unwrap_or_default();
                let call = self.send(channel.as_ref(), queue, body, persistent);
                self.breaker
                    .invoke(self, &Action::publish(queue), &args, call)
                    .await
            }
            None => Invocation::Failed(CallFailure::Error(PublishError::Unavailable)),
        };

        let request = args.dump.unwrap_or_else(|| {
            DumpRequest::new(queue, Vec::new(), job_type).with_persistent(persistent)
        });
        match outcome {
            Invocation::Completed(()) => {
                debug!(queue = %queue, "Message published");
                Ok(Delivery::Delivered)
            }
            Invocation::Denied(Fallback::Dumped(result)) => {
                result.map(|_| Delivery::Dumped).map_err(ClientError::Dump)
            }
            Invocation::Denied(Fallback::Unavailable) => self.dump(request).await,
            Invocation::Failed(failure) => {
                let err = publish_error(failure, queue);
                self.last_error.set_last_error(
                    ErrorRequest::new(codes::AMQP_PUBLISH)
                        .message(format!("publish to {} failed, dumping", queue))
                        .level(Severity::Warning)
                        .cause(err),
                );
                self.dump(request).await
            }
        }
    }

    /// Publish through the breaker without dump routing.
    pub async fn publish_direct(
        &self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> std::result::Result<(), PublishError> {
        let channel = self
            .connection
            .channel(self)
            .await
            .ok_or(PublishError::Unavailable)?;

        let args = CallArgs::default();
        let call = self.send(channel.as_ref(), queue, body, persistent);
        match self
            .breaker
            .invoke(self, &Action::publish(queue), &args, call)
            .await
        {
            Invocation::Completed(()) => Ok(()),
            Invocation::Failed(failure) => Err(publish_error(failure, queue)),
            Invocation::Denied(_) => Err(PublishError::Denied(queue.to_string())),
        }
    }

    async fn send(
        &self,
        channel: &dyn BrokerChannel,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> std::result::Result<(), PublishError> {
        self.connection.declare_queue(channel, queue).await?;
        channel.publish("", queue, body, persistent).await?;
        Ok(())
    }

    async fn dump(&self, request: DumpRequest) -> Result<Delivery> {
        self.output(request)
            .await
            .map(|_| Delivery::Dumped)
            .map_err(ClientError::Dump)
    }

    /// Append to the dump store; a failure here is escalated at emergency level.
    async fn output(&self, request: DumpRequest) -> std::result::Result<i64, DumpError> {
        let queue = request.queue.clone();
        let result = match &self.dumper {
            Some(dumper) => dumper.output(request).await,
            None => Err(DumpError::Config("no dump store configured".into())),
        };

        match &result {
            Ok(id) => warn!(id, queue = %queue, "Message dumped for later recovery"),
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to dump message, it is lost");
                self.last_error.set_last_error(
                    ErrorRequest::new(codes::DUMP)
                        .message(format!("message for {} could not be dumped", queue))
                        .level(Severity::Emergency)
                        .developer_message(e.to_string()),
                );
            }
        }
        result
    }
}

fn publish_error(failure: CallFailure<PublishError>, queue: &str) -> PublishError {
    match failure {
        CallFailure::Error(e) => e,
        CallFailure::TimedOut(budget) => PublishError::TimedOut {
            queue: queue.to_string(),
            budget,
        },
    }
}

#[async_trait]
impl Provider for AmqpClient {
    type Args = CallArgs;
    type Fallback = Fallback;

    fn participation(&self, action: &Action, _args: &CallArgs) -> Participation {
        let budget = match action.kind() {
            ActionKind::EstablishConnection => self.budgets.connect,
            ActionKind::OpenChannel => self.budgets.channel,
            ActionKind::Publish => self.budgets.publish,
        };
        if budget.is_zero() {
            Participation::DefaultBudget
        } else {
            Participation::Budget(budget)
        }
    }

    async fn on_denied(&self, action: &Action, args: &CallArgs) -> Fallback {
        match (action.kind(), &args.dump) {
            (ActionKind::Publish, Some(request)) => {
                debug!(action = %action, "Publish denied by breaker, dumping");
                Fallback::Dumped(self.output(request.clone()).await)
            }
            _ => Fallback::Unavailable,
        }
    }

    fn is_monitored(&self) -> bool {
        self.monitored
    }
}

#[async_trait]
impl Republisher for AmqpClient {
    /// A replay pass is the explicit retry point for a failed connection.
    async fn prepare(&self) {
        if self.connection.is_failed().await {
            info!("Resetting failed broker connection before recovery pass");
            self.connection.reset().await;
        }
    }

    async fn republish(&self, record: &DumpedRecord) -> anyhow::Result<()> {
        self.publish_direct(&record.queue, &record.payload, record.persistent)
            .await?;
        Ok(())
    }
}
