//! Process-wide configuration.
//!
//! Built once at startup and handed by reference to every component
//! constructor. Nothing reads the environment after that.

use crate::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub executions: ExecutionsConfig,
    pub push: PushConfig,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            kind: DatabaseKind::Sqlite,
            path: PathBuf::from("flow.sqlite"),
        }
    }
}

/// Whether run data of finished executions is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveDataPolicy {
    All,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionsConfig {
    pub save_data_on_error: SaveDataPolicy,
    pub save_data_on_success: SaveDataPolicy,
    pub save_manual_executions: bool,
    /// Seconds before a run is cancelled; 0 disables the limit.
    pub timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub delete_batch_size: usize,
    /// Above this many rows an unfiltered count is estimated.
    pub estimate_threshold: u64,
}

impl Default for ExecutionsConfig {
    fn default() -> Self {
        Self {
            save_data_on_error: SaveDataPolicy::All,
            save_data_on_success: SaveDataPolicy::All,
            save_manual_executions: true,
            timeout_secs: 0,
            max_timeout_secs: 3600,
            delete_batch_size: 100,
            estimate_threshold: 100_000,
        }
    }
}

impl ExecutionsConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs.min(self.max_timeout_secs.max(1)))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub subscriber_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1000,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_parallel_nodes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
        }
    }
}

impl Config {
    /// Defaults overridden by `FLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// JSON file, then environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("FLOW_DB_KIND") {
            self.database.kind = parse_enum("FLOW_DB_KIND", &v)?;
        }
        if let Some(v) = lookup("FLOW_DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FLOW_EXECUTION_TIMEOUT") {
            self.executions.timeout_secs = parse_num("FLOW_EXECUTION_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("FLOW_SAVE_DATA_ON_ERROR") {
            self.executions.save_data_on_error = parse_enum("FLOW_SAVE_DATA_ON_ERROR", &v)?;
        }
        if let Some(v) = lookup("FLOW_SAVE_DATA_ON_SUCCESS") {
            self.executions.save_data_on_success = parse_enum("FLOW_SAVE_DATA_ON_SUCCESS", &v)?;
        }
        if let Some(v) = lookup("FLOW_SAVE_MANUAL") {
            self.executions.save_manual_executions = parse_num("FLOW_SAVE_MANUAL", &v)?;
        }
        if let Some(v) = lookup("FLOW_PUSH_CAPACITY") {
            self.push.subscriber_capacity = parse_num("FLOW_PUSH_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("FLOW_PUSH_OVERFLOW") {
            self.push.overflow = parse_enum("FLOW_PUSH_OVERFLOW", &v)?;
        }
        if let Some(v) = lookup("FLOW_WAIT_POLL_MS") {
            self.scheduler.poll_interval_ms = parse_num("FLOW_WAIT_POLL_MS", &v)?;
        }
        if let Some(v) = lookup("BIND_ADDRESS") {
            self.server.bind_address = v;
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Enum values use their serde names, e.g. `sqlite` or `dropNewest`.
fn parse_enum<T: serde::de::DeserializeOwned>(key: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_string())).map_err(|_| {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }
    })
}
