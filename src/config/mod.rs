//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod server;

pub use server::ServerConfig;

use serde::Deserialize;

use crate::event::non_blank;
use crate::queue::{QueueConfig, DEFAULT_QUEUE_NAME};
use crate::store::StorageConfig;
use crate::utils::retry::RetryConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "RESERVER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "RESERVER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "RESERVER_LOG";

/// Legacy variable for the object store connection.
pub const BLOB_CONNECTION_ENV_VAR: &str = "BLOB_CONNECTION_STRING";
/// Legacy variable for the snapshot container.
pub const BLOB_CONTAINER_ENV_VAR: &str = "BLOB_CONTAINER_NAME";
/// Legacy variable for the queue connection.
pub const QUEUE_CONNECTION_ENV_VAR: &str = "SERVICEBUS_CONNECTION_STRING";
/// Legacy variable for the queue name.
pub const QUEUE_NAME_ENV_VAR: &str = "SERVICEBUS_QUEUE_NAME";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP ingress configuration.
    pub server: ServerConfig,
    /// Snapshot storage configuration.
    pub storage: StorageConfig,
    /// Order update queue configuration.
    pub queue: QueueConfig,
    /// Snapshot write retry configuration.
    pub retry: RetryConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    /// 5. Legacy variables, for values still unset
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_legacy_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Fill unset values from the legacy variables.
    ///
    /// The queue name counts as unset while it still has its default.
    pub fn apply_legacy_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| env(name).filter(|v| !v.trim().is_empty());

        if self.storage.connection().is_none() {
            if let Some(value) = lookup(BLOB_CONNECTION_ENV_VAR) {
                self.storage.connection = Some(value);
            }
        }
        if self.storage.container().is_none() {
            if let Some(value) = lookup(BLOB_CONTAINER_ENV_VAR) {
                self.storage.container = Some(value);
            }
        }
        if non_blank(self.queue.connection.as_deref()).is_none() {
            if let Some(value) = lookup(QUEUE_CONNECTION_ENV_VAR) {
                self.queue.connection = Some(value);
            }
        }
        if self.queue.name == DEFAULT_QUEUE_NAME {
            if let Some(value) = lookup(QUEUE_NAME_ENV_VAR) {
                self.queue.name = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ReplaceStrategy;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.server.port, 7071);
        assert!(!config.storage.is_configured());
        assert_eq!(config.queue.name, "order-updates");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_ms, 1000);
    }

    #[test]
    fn test_legacy_env_fills_missing_values() {
        let mut config = Config::default();

        config.apply_legacy_env(lookup_from(&[
            (BLOB_CONNECTION_ENV_VAR, "file:///tmp/snapshots"),
            (BLOB_CONTAINER_ENV_VAR, "order-items"),
            (QUEUE_CONNECTION_ENV_VAR, "amqp://rabbit:5672"),
            (QUEUE_NAME_ENV_VAR, "legacy-orders"),
        ]));

        assert_eq!(config.storage.connection(), Some("file:///tmp/snapshots"));
        assert_eq!(config.storage.container(), Some("order-items"));
        assert_eq!(config.queue.connection(), "amqp://rabbit:5672");
        assert_eq!(config.queue.name, "legacy-orders");
    }

    #[test]
    fn test_legacy_env_never_overrides() {
        let mut config = Config::default();
        config.storage.connection = Some("memory://".to_string());
        config.storage.container = Some("configured".to_string());
        config.queue.name = "configured-queue".to_string();

        config.apply_legacy_env(lookup_from(&[
            (BLOB_CONNECTION_ENV_VAR, "file:///tmp/snapshots"),
            (BLOB_CONTAINER_ENV_VAR, "legacy"),
            (QUEUE_NAME_ENV_VAR, "legacy-orders"),
        ]));

        assert_eq!(config.storage.connection(), Some("memory://"));
        assert_eq!(config.storage.container(), Some("configured"));
        assert_eq!(config.queue.name, "configured-queue");
    }

    #[test]
    fn test_legacy_env_ignores_blank_values() {
        let mut config = Config::default();

        config.apply_legacy_env(lookup_from(&[(BLOB_CONTAINER_ENV_VAR, "  ")]));

        assert!(config.storage.container.is_none());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
server:
  port: 8080
  direct_retry: true
storage:
  connection: memory://
  container: order-snapshots
  replace: overwrite
queue:
  name: reservations
  max_delivery_count: 5
retry:
  max_attempts: 4
  delay_ms: 250
"#
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(config.server.direct_retry);
        assert!(config.storage.is_configured());
        assert_eq!(config.storage.replace, ReplaceStrategy::Overwrite);
        assert_eq!(config.queue.name, "reservations");
        assert_eq!(config.queue.max_delivery_count(), 5);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.delay_ms, 250);
    }

    #[test]
    #[serial]
    fn test_prefixed_env_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "server:\n  port: 8080\n").unwrap();

        std::env::set_var("RESERVER__SERVER__PORT", "9090");
        let config = Config::load(file.path().to_str());
        std::env::remove_var("RESERVER__SERVER__PORT");

        assert_eq!(config.unwrap().server.port, 9090);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let result = Config::load(Some("/nonexistent/reserver.yaml"));
        assert!(result.is_err());
    }
}
