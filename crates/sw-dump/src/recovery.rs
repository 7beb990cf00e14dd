//! Background replay of dumped records.
//!
//! Runs [`Replayer::recover`] on a fixed interval until the shutdown signal
//! fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::replayer::{RecoveryReport, Replayer};
use crate::RecordFilter;

/// Configuration for the recovery task.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How often to replay. Default: 60 seconds.
    pub interval: Duration,
    /// Records selected per pass
    pub filter: RecordFilter,
    /// Whether recovery is enabled. Default: true.
    pub enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            filter: RecordFilter::all().limit(500),
            enabled: true,
        }
    }
}

pub struct RecoveryTask {
    replayer: Arc<Replayer>,
    config: RecoveryConfig,
}

impl RecoveryTask {
    pub fn new(replayer: Arc<Replayer>, config: RecoveryConfig) -> Self {
        Self { replayer, config }
    }

    /// Replay on every tick until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        if !self.config.enabled {
            info!("Dump recovery task is disabled");
            return;
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            job_type = ?self.config.filter.job_type,
            queue = ?self.config.filter.queue,
            "Starting dump recovery task"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.recover_once().await;
                }
                _ = shutdown.recv() => {
                    info!("Dump recovery task stopping");
                    break;
                }
            }
        }
    }

    /// Perform a single recovery pass.
    pub async fn recover_once(&self) -> Option<RecoveryReport> {
        debug!("Checking for dumped records");
        match self.replayer.recover(&self.config.filter).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Failed to read dumped records");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RecoveryConfig::default();
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.filter.limit, Some(500));
        assert!(config.enabled);
    }
}
