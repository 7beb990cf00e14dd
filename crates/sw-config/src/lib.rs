//! Spillway Configuration System
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub amqp: AmqpConfig,
    pub breaker: BreakerConfig,
    pub dump: DumpConfig,
    pub replay: ReplayConfig,
    pub errors: ErrorsConfig,

    /// Data directory for local storage
    pub data_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            amqp: AmqpConfig::default(),
            breaker: BreakerConfig::default(),
            dump: DumpConfig::default(),
            replay: ReplayConfig::default(),
            errors: ErrorsConfig::default(),
            data_dir: "./data".to_string(),
        }
    }
}

/// Broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// One or more endpoints: bare hosts or `amqp://host:port` URLs
    pub hosts: Vec<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_timeout_ms: u64,
    pub read_write_timeout_ms: u64,
    /// Heartbeat interval in seconds, 0 disables heartbeats
    pub heartbeat_secs: u16,
    pub connection_name: String,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1".to_string()],
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            connection_timeout_ms: 3000,
            read_write_timeout_ms: 3000,
            heartbeat_secs: 0,
            connection_name: "spillway".to_string(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before an action opens
    pub failure_threshold: u32,
    /// How long an open action rejects every call
    pub cooldown_ms: u64,
    /// Openness (percent) right after the cooldown elapses
    pub probe_openness: u8,
    /// Time for openness to climb from `probe_openness` to 100
    pub ramp_ms: u64,
    /// Budget for actions that ask for the default timeout
    pub default_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub channel_timeout_ms: u64,
    pub publish_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            probe_openness: 10,
            ramp_ms: 60_000,
            default_timeout_ms: 100,
            connect_timeout_ms: 1000,
            channel_timeout_ms: 1000,
            publish_timeout_ms: 1000,
        }
    }
}

/// Dump store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    /// `sqlite` or `memory`
    pub backend: String,
    pub database_url: String,
    pub max_connections: u32,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            database_url: "sqlite://./data/spillway-dump.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

/// Recovery replay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Records fetched per pass
    pub batch_size: u32,
    /// Stop retrying a record after this many failed replays (kept in store)
    pub max_attempts: Option<u32>,
    /// Only replay records of this job type (MESSAGE, FUNCTION_CALL)
    pub job_type: Option<String>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            batch_size: 500,
            max_attempts: None,
            job_type: None,
        }
    }
}

/// Last-error sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorsConfig {
    /// `production` suppresses backtraces below critical
    pub environment: String,
    /// Minimum severity that gets logged (syslog names)
    pub log_threshold: String,
    pub log_disabled: bool,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_threshold: "notice".to_string(),
            log_disabled: false,
        }
    }
}

impl ErrorsConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

const SEVERITY_NAMES: &[&str] = &[
    "emergency", "emerg", "alert", "critical", "crit", "error", "err",
    "warning", "warn", "notice", "info", "debug",
];

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.amqp.hosts.iter().all(|h| h.trim().is_empty()) {
            return Err(ConfigError::ValidationError("amqp.hosts must not be empty".into()));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.breaker.probe_openness > 100 {
            return Err(ConfigError::ValidationError(
                "breaker.probe_openness must be within 0..=100".into(),
            ));
        }
        if !matches!(self.dump.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown dump.backend '{}', use sqlite or memory",
                self.dump.backend
            )));
        }
        if self.replay.batch_size == 0 {
            return Err(ConfigError::ValidationError("replay.batch_size must be at least 1".into()));
        }
        if !SEVERITY_NAMES.contains(&self.errors.log_threshold.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "unknown errors.log_threshold '{}'",
                self.errors.log_threshold
            )));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Spillway Configuration
# Environment variables override these settings

data_dir = "./data"

[amqp]
hosts = ["amqp://127.0.0.1:5672"]
port = 5672
user = "guest"
password = "guest"
vhost = "/"
connection_timeout_ms = 3000
read_write_timeout_ms = 3000
heartbeat_secs = 0
connection_name = "spillway"

[breaker]
failure_threshold = 5
cooldown_ms = 30000
probe_openness = 10
ramp_ms = 60000
default_timeout_ms = 100
connect_timeout_ms = 1000
channel_timeout_ms = 1000
publish_timeout_ms = 1000

[dump]
backend = "sqlite"
database_url = "sqlite://./data/spillway-dump.db?mode=rwc"
max_connections = 5

[replay]
enabled = true
interval_secs = 60
batch_size = 500
# max_attempts = 20
# job_type = "MESSAGE"

[errors]
environment = "development"
log_threshold = "notice"
log_disabled = false
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.amqp.port, 5672);
        assert_eq!(config.breaker.publish_timeout_ms, 1000);
        assert!(config.replay.max_attempts.is_none());
    }

    #[test]
    fn test_example_toml_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example_toml()).unwrap();
        assert_eq!(config.amqp.hosts, vec!["amqp://127.0.0.1:5672".to_string()]);
        assert_eq!(config.dump.backend, "sqlite");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[breaker]\nfailure_threshold = 3\n\n[replay]\nmax_attempts = 7").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_ms, 30_000);
        assert_eq!(config.replay.max_attempts, Some(7));
        assert_eq!(config.amqp.user, "guest");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = AppConfig::default();
        config.amqp.hosts = vec![];
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = AppConfig::default();
        config.breaker.probe_openness = 101;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dump.backend = "redis".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.errors.log_threshold = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_detection() {
        let mut errors = ErrorsConfig::default();
        assert!(!errors.is_production());
        errors.environment = "Production".to_string();
        assert!(errors.is_production());
    }
}
