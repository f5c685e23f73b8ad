//! Configuration management for the Pulse real-time core

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub call: CallConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// How far back the reconciliation sweep looks for undelivered messages.
    pub sweep_lookback_hours: u64,
    /// Upper bound on messages reconciled per connection.
    pub sweep_batch_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// How long a callee has to answer before the call is marked missed.
    pub ring_timeout_seconds: u64,
}

impl Config {
    pub async fn load(path: &str) -> anyhow::Result<Self> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path).await?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            let content = toml::to_string_pretty(&config)?;
            fs::write(path, content).await?;
            tracing::info!("Created default config at {}", path);
            Ok(config)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 9800,
            },
            storage: StorageConfig {
                database_path: "./data/pulse-rtm.db".to_string(),
            },
            delivery: DeliveryConfig {
                sweep_lookback_hours: 168, // 7 days
                sweep_batch_size: 200,
            },
            call: CallConfig {
                ring_timeout_seconds: 30,
            },
        }
    }
}
