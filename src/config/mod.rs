//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod storage;

pub use messaging::{MessagingConfig, ReconnectConfig};
pub use storage::{StorageConfig, StorageType};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "REPLICA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "REPLICA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "REPLICA_LOG";

use serde::Deserialize;

use crate::bus::{PublishRoute, Subscription};
use crate::projection::{Catalog, EntitySchema};
use crate::topology::Topology;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name of this service; prefixes consumer tags and log lines.
    pub service: String,
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Exchanges, queues and bindings declared on every (re)connect.
    pub topology: Topology,
    /// Entity to exchange routes for publishing.
    pub routes: Vec<PublishRoute>,
    /// Queues to consume.
    pub subscriptions: Vec<Subscription>,
    /// Projection storage.
    pub storage: StorageConfig,
    /// Projected entities. Defaults to the campus catalog.
    pub catalog: Option<Vec<EntitySchema>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: "replica".to_string(),
            messaging: MessagingConfig::default(),
            topology: Topology::default(),
            routes: Vec::new(),
            subscriptions: Vec::new(),
            storage: StorageConfig::default(),
            catalog: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
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

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross references: the topology is consistent, every route
    /// targets a declared exchange and every subscription a declared queue.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.topology
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        // An empty topology means the exchanges are declared elsewhere.
        if self.topology.is_empty() {
            return Ok(());
        }

        let exchanges = self
            .routes
            .iter()
            .map(|route| route.exchange.as_str())
            .chain(self.messaging.default_exchange.as_deref());
        for exchange in exchanges {
            if self.topology.exchange(exchange).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "route targets undeclared exchange {}",
                    exchange
                )));
            }
        }

        for subscription in &self.subscriptions {
            if !self
                .topology
                .queues()
                .iter()
                .any(|queue| queue.name == subscription.queue)
            {
                return Err(ConfigError::Invalid(format!(
                    "subscription to undeclared queue {}",
                    subscription.queue
                )));
            }
        }
        Ok(())
    }

    /// Configured catalog, or the campus catalog when none is given.
    pub fn catalog(&self) -> Catalog {
        match &self.catalog {
            Some(schemas) => Catalog::new(schemas.iter().cloned()),
            None => Catalog::campus(),
        }
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            storage: StorageConfig::memory(),
            ..Self::default()
        }
    }
}
