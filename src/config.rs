//! Configuration management for laneforge.
//!
//! Loads settings from a TOML file and overlays the handful of environment
//! options called out in the spec (`maxConcurrentSagas`, `wal.writeMode`,
//! `redis.addr`, cleanup interval/retention).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub wal: WalConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            wal: WalConfig::default(),
            cleanup: CleanupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for the embedded key-value store backing the WAL,
    /// checkpoints, and the saga store.
    pub data_dir: String,
    pub redis: Option<RedisConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data/laneforge".to_string(),
            redis: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub addr: String,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            addr: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "laneforge:lane:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_concurrent_sagas: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sagas: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalWriteMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    pub write_mode: WalWriteMode,
    pub async_queue_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            write_mode: WalWriteMode::Async,
            async_queue_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub retention_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            retention_secs: 7 * 24 * 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    /// Loads configuration from `CONFIG_FILE` (default
    /// `config/default.toml`). Falls back to defaults when the file is
    /// absent; a file that exists but fails to parse is still an error.
    pub fn load() -> Result<Self, crate::errors::EngineError> {
        let path =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

        match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).map_err(|e| {
                crate::errors::EngineError::ConfigError(format!(
                    "failed to parse config file {}: {}",
                    path, e
                ))
            }),
            Err(_) => Ok(Config::default()),
        }
    }
}
