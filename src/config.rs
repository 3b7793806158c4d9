//! Application Configuration
//!
//! Values come from CLI flags (with environment fallbacks, see `main.rs`) or
//! from a JSON file. Retry count and poll interval are accepted for every
//! topic; the subscribe worker does not poll, and the retry count only bounds
//! the startup connection attempts.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::node::{NodeConfig, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_ENDPOINT};
use crate::registry::TopicKind;
use crate::worker::{SubscriptionPolicy, DEFAULT_SOURCE, QUEUE_CAPACITY};

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment environment; selects the log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Development,
    Production,
}

/// App level config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub environment: Environment,
    /// Root of the output tree
    pub data_dir: PathBuf,
    /// IPC path or WebSocket URL of the node
    pub rpc_endpoint: String,
    pub num_of_retries: u32,
    pub poll_interval_ms: u64,
    pub topic: TopicKind,
    /// Label written to every source log line
    pub source_label: String,
    pub queue_capacity: usize,
    pub subscription_policy: SubscriptionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::default(),
            data_dir: PathBuf::from("tmp"),
            rpc_endpoint: DEFAULT_ENDPOINT.to_string(),
            num_of_retries: DEFAULT_CONNECT_ATTEMPTS,
            poll_interval_ms: 1000,
            topic: TopicKind::PendingTransactions,
            source_label: DEFAULT_SOURCE.to_string(),
            queue_capacity: QUEUE_CAPACITY,
            subscription_policy: SubscriptionPolicy::default(),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("rpc_endpoint cannot be empty".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".to_string()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data_dir cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Node connection settings derived from this config
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            max_attempts: self.num_of_retries.max(1),
            ..NodeConfig::with_endpoint(self.rpc_endpoint.clone())
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}
