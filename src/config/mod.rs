//! # Engine Configuration
//!
//! Layered configuration for workers, queues, retry backoff, the database pool and
//! logging. Values come from (lowest to highest precedence) built-in defaults, an
//! optional YAML file, an optional environment-specific YAML overlay, and
//! `TASKER_DAG__SECTION__FIELD` environment variables.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use tasker_dag::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().worker.batch_size;
//! let poll_interval = manager.config().worker.poll_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::orchestration::backoff::RetryPolicy;
use crate::workflow::StepDefaults;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/tasker-dag.yaml`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Poll loop and concurrency settings
    pub worker: WorkerConfig,

    /// Queue naming and visibility defaults
    pub queue: QueueConfig,

    /// Retry limits and exponential backoff
    pub backoff: BackoffConfig,

    /// PostgreSQL connection pool
    pub database: DatabaseConfig,

    /// Structured logging output
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum messages read per poll
    pub batch_size: usize,
    /// Wait between polls while the queue is empty or erroring
    pub poll_interval_ms: u64,
    /// Long-poll window of a single read
    pub poll_timeout_ms: u64,
    /// Handlers executing at once per worker
    pub max_concurrency: usize,
    pub heartbeat_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_interval_ms: 100,
            poll_timeout_ms: 5000,
            max_concurrency: 10,
            heartbeat_interval_ms: 5000,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Step timeout when a step does not declare one; also the read visibility timeout
    pub default_visibility_timeout_seconds: u64,
    /// `{workflow}` is replaced by the workflow name
    pub queue_naming_pattern: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_visibility_timeout_seconds: 30,
            queue_naming_pattern: "{workflow}_tasks".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn default_visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.default_visibility_timeout_seconds)
    }

    /// Queue that carries every task of the given workflow
    pub fn queue_name_for(&self, workflow_name: &str) -> String {
        self.queue_naming_pattern.replace("{workflow}", workflow_name)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub default_max_attempts: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 300_000,
        }
    }
}

impl BackoffConfig {
    pub fn base_retry_delay(&self) -> Duration {
        Duration::from_millis(self.base_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Falls back to `DATABASE_URL` when unset
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    /// Apply embedded migrations when connecting
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 30,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    /// Resolve the connection string, preferring the explicit setting
    pub fn database_url(&self) -> ConfigResult<String> {
        if let Some(url) = self.url.as_ref().filter(|url| !url.is_empty()) {
            return Ok(url.clone());
        }
        std::env::var("DATABASE_URL").map_err(|_| {
            ConfigurationError::missing_required_field("url", "database (or DATABASE_URL)")
        })
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; derived from the environment when unset
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl EngineConfig {
    /// Reject values that would stall or misconfigure workers
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.batch_size",
                "0",
                "must be at least 1",
            ));
        }
        if self.worker.max_concurrency == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.max_concurrency",
                "0",
                "must be at least 1",
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.poll_interval_ms",
                "0",
                "must be positive",
            ));
        }
        if self.queue.default_visibility_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "queue.default_visibility_timeout_seconds",
                "0",
                "must be positive",
            ));
        }
        if !self.queue.queue_naming_pattern.contains("{workflow}") {
            return Err(ConfigurationError::invalid_value(
                "queue.queue_naming_pattern",
                self.queue.queue_naming_pattern.clone(),
                "must contain the {workflow} placeholder",
            ));
        }
        if self.backoff.default_max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "backoff.default_max_attempts",
                "0",
                "must be at least 1",
            ));
        }
        if self.backoff.base_retry_delay_ms > self.backoff.max_retry_delay_ms {
            return Err(ConfigurationError::validation_error(format!(
                "backoff.base_retry_delay_ms ({}) exceeds backoff.max_retry_delay_ms ({})",
                self.backoff.base_retry_delay_ms, self.backoff.max_retry_delay_ms
            )));
        }
        if self.database.max_connections == 0
            || self.database.min_connections > self.database.max_connections
        {
            return Err(ConfigurationError::validation_error(format!(
                "database pool bounds invalid: min {} / max {}",
                self.database.min_connections, self.database.max_connections
            )));
        }
        Ok(())
    }

    /// Defaults applied to steps that do not declare their own timeout or attempt limit
    pub fn step_defaults(&self) -> StepDefaults {
        StepDefaults {
            timeout: self.queue.default_visibility_timeout(),
            max_attempts: self.backoff.default_max_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff.base_retry_delay(),
            self.backoff.max_retry_delay(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.batch_size, 5);
        assert_eq!(config.worker.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.backoff.default_max_attempts, 3);
        assert_eq!(config.queue.default_visibility_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_queue_name_pattern() {
        let queue = QueueConfig::default();
        assert_eq!(queue.queue_name_for("payments"), "payments_tasks");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.worker.batch_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidValue { .. })
        ));

        let mut config = EngineConfig::default();
        config.queue.queue_naming_pattern = "static_queue".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.backoff.base_retry_delay_ms = 10_000;
        config.backoff.max_retry_delay_ms = 1_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_explicit_database_url_wins() {
        let database = DatabaseConfig {
            url: Some("postgresql://localhost/explicit".to_string()),
            ..DatabaseConfig::default()
        };
        assert_eq!(
            database.database_url().unwrap(),
            "postgresql://localhost/explicit"
        );
    }

    #[test]
    fn test_step_defaults_follow_config() {
        let mut config = EngineConfig::default();
        config.queue.default_visibility_timeout_seconds = 12;
        config.backoff.default_max_attempts = 7;
        let defaults = config.step_defaults();
        assert_eq!(defaults.timeout, Duration::from_secs(12));
        assert_eq!(defaults.max_attempts, 7);
    }
}
