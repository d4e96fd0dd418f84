//! Configuration Loader
//!
//! Environment-aware loading: `tasker-dag.yaml` from the config directory, then the
//! `tasker-dag.{environment}.yaml` overlay, then `TASKER_DAG__*` environment variables.

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use config::{Config, Environment, File};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "tasker-dag";
const ENV_PREFIX: &str = "TASKER_DAG";

pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_overrides(config_dir, environment, None)
    }

    /// Load with an explicit environment-variable map instead of the process environment.
    ///
    /// Keys use the same `TASKER_DAG__SECTION__FIELD` shape as real variables.
    pub fn load_with_overrides(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_vars: Option<HashMap<String, String>>,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let base_file = config_directory.join(format!("{BASE_FILE_STEM}.yaml"));
        let overlay_file = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.yaml"));

        let config = Config::builder()
            .add_source(File::from(base_file.clone()).required(false))
            .add_source(File::from(overlay_file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(env_vars),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(base_file.display().to_string(), e))?;

        let config: EngineConfig = config
            .try_deserialize()
            .map_err(|e| ConfigurationError::load_error(base_file.display().to_string(), e))?;

        config.validate()?;

        info!(
            environment = %environment,
            config_directory = %config_directory.display(),
            batch_size = config.worker.batch_size,
            max_concurrency = config.worker.max_concurrency,
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Load a single explicit file; unlike directory loading, the file must exist
    pub fn load_from_file(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        if !path.is_file() {
            return Err(ConfigurationError::config_file_not_found(path));
        }

        let config: EngineConfig = Config::builder()
            .add_source(File::from(path.to_path_buf()))
            .build()
            .and_then(Config::try_deserialize::<EngineConfig>)
            .map_err(|e| ConfigurationError::load_error(path.display().to_string(), e))?;

        config.validate()?;

        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(Self::default_config_directory),
        }))
    }

    /// Wrap an already-built configuration
    pub fn from_config(config: EngineConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_directory: Self::default_config_directory(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect environment from environment variables
    pub fn detect_environment() -> String {
        env::var("TASKER_DAG_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("TASKER_DAG_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }
}
