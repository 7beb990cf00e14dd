//! lapin-backed broker transport
//!
//! Channels run in publisher-confirm mode; a publish only succeeds once the
//! broker acked it. Persistent messages use delivery mode 2.

use async_trait::async_trait;
use lapin::{
    options::*, publisher_confirm::Confirmation, types::FieldTable, BasicProperties, Channel,
    Connection, ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, ConnectParams,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(
            &params.uri(),
            ConnectionProperties::default()
                .with_connection_name(params.connection_name.clone().into()),
        )
        .await
        .map_err(|e| BrokerError::Connect(e.to_string()))?;

        info!(endpoint = %params.endpoint, vhost = %params.vhost, "AMQP connection established");

        Ok(Arc::new(LapinConnection {
            connection,
            confirm_timeout: Duration::from_millis(params.read_write_timeout_ms.max(1)),
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    confirm_timeout: Duration,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(e.to_string()))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("confirm mode: {}", e)))?;

        debug!(channel_id = channel.id(), "AMQP channel opened");
        Ok(Arc::new(LapinChannel {
            channel,
            confirm_timeout: self.confirm_timeout,
        }))
    }
}

struct LapinChannel {
    channel: Channel,
    confirm_timeout: Duration,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Declare {
                queue: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(if persistent { 2 } else { 1 })
            .with_content_type("application/json".into());

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?;

        let confirmation = tokio::time::timeout(self.confirm_timeout, confirm)
            .await
            .map_err(|_| BrokerError::Publish("timed out waiting for confirm".into()))?
            .map_err(|e| BrokerError::Publish(format!("confirm failed: {}", e)))?;

        if matches!(confirmation, Confirmation::Nack(_)) {
            return Err(BrokerError::Nack);
        }
        Ok(())
    }
}
