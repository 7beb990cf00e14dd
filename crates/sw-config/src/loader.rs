//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "spillway.toml",
    "config.toml",
    "./config/spillway.toml",
    "/etc/spillway/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, |key| env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("SPILLWAY_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `SPILLWAY_*` overrides read through `lookup`.
fn apply_overrides<F>(config: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(val: Option<String>) -> Option<T> {
        val.and_then(|v| v.parse().ok())
    }

    // AMQP
    if let Some(val) = lookup("SPILLWAY_AMQP_HOSTS") {
        config.amqp.hosts = val
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(port) = parsed(lookup("SPILLWAY_AMQP_PORT")) {
        config.amqp.port = port;
    }
    if let Some(val) = lookup("SPILLWAY_AMQP_USER") {
        config.amqp.user = val;
    }
    if let Some(val) = lookup("SPILLWAY_AMQP_PASSWORD") {
        config.amqp.password = val;
    }
    if let Some(val) = lookup("SPILLWAY_AMQP_VHOST") {
        config.amqp.vhost = val;
    }
    if let Some(ms) = parsed(lookup("SPILLWAY_AMQP_CONNECTION_TIMEOUT_MS")) {
        config.amqp.connection_timeout_ms = ms;
    }
    if let Some(secs) = parsed(lookup("SPILLWAY_AMQP_HEARTBEAT_SECS")) {
        config.amqp.heartbeat_secs = secs;
    }

    // Breaker
    if let Some(threshold) = parsed(lookup("SPILLWAY_BREAKER_FAILURE_THRESHOLD")) {
        config.breaker.failure_threshold = threshold;
    }
    if let Some(ms) = parsed(lookup("SPILLWAY_BREAKER_COOLDOWN_MS")) {
        config.breaker.cooldown_ms = ms;
    }
    if let Some(openness) = parsed(lookup("SPILLWAY_BREAKER_PROBE_OPENNESS")) {
        config.breaker.probe_openness = openness;
    }
    if let Some(ms) = parsed(lookup("SPILLWAY_BREAKER_PUBLISH_TIMEOUT_MS")) {
        config.breaker.publish_timeout_ms = ms;
    }

    // Dump
    if let Some(val) = lookup("SPILLWAY_DUMP_BACKEND") {
        config.dump.backend = val;
    }
    if let Some(val) = lookup("SPILLWAY_DUMP_DATABASE_URL") {
        config.dump.database_url = val;
    }

    // Replay
    if let Some(val) = lookup("SPILLWAY_REPLAY_ENABLED") {
        config.replay.enabled = val.parse().unwrap_or(true);
    }
    if let Some(secs) = parsed(lookup("SPILLWAY_REPLAY_INTERVAL_SECS")) {
        config.replay.interval_secs = secs;
    }
    if let Some(size) = parsed(lookup("SPILLWAY_REPLAY_BATCH_SIZE")) {
        config.replay.batch_size = size;
    }
    if let Some(max) = parsed(lookup("SPILLWAY_REPLAY_MAX_ATTEMPTS")) {
        config.replay.max_attempts = Some(max);
    }
    if let Some(val) = lookup("SPILLWAY_REPLAY_JOB_TYPE") {
        config.replay.job_type = Some(val);
    }

    // Errors
    if let Some(val) = lookup("SPILLWAY_ENV") {
        config.errors.environment = val;
    }
    if let Some(val) = lookup("SPILLWAY_ERROR_LOG_THRESHOLD") {
        config.errors.log_threshold = val;
    }

    // General
    if let Some(val) = lookup("SPILLWAY_DATA_DIR") {
        config.data_dir = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[
                ("SPILLWAY_AMQP_HOSTS", "amqp://a:5672, amqp://b:5673,"),
                ("SPILLWAY_BREAKER_FAILURE_THRESHOLD", "2"),
                ("SPILLWAY_REPLAY_MAX_ATTEMPTS", "9"),
                ("SPILLWAY_ENV", "production"),
            ]),
        );

        assert_eq!(config.amqp.hosts, vec!["amqp://a:5672", "amqp://b:5673"]);
        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.replay.max_attempts, Some(9));
        assert!(config.errors.is_production());
    }

    #[test]
    fn test_unparseable_values_are_ignored() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            lookup_from(&[("SPILLWAY_AMQP_PORT", "not-a-port")]),
        );
        assert_eq!(config.amqp.port, 5672);
    }

    #[test]
    fn test_explicit_path_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spillway.toml");
        std::fs::write(&path, "[dump]\nbackend = \"memory\"\n").unwrap();

        let config = ConfigLoader::with_path(&path).load().unwrap();
        assert_eq!(config.dump.backend, "memory");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spillway.toml");
        std::fs::write(&path, "[breaker]\nfailure_threshold = 0\n").unwrap();

        let err = ConfigLoader::with_path(&path).load().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }
}
