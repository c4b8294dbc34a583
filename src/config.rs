use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use crate::consensus::SealerConfig;
use crate::types::Address;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Mempool admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pending transactions across all senders
    pub max_pending: usize,
    pub max_pending_per_sender: usize,
    /// Furthest a pending nonce may run ahead of the sender's state nonce
    pub max_nonce_gap: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_pending: 4_096,
            max_pending_per_sender: 64,
            max_nonce_gap: 64,
        }
    }
}

/// Node settings, read from a JSON file. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub chain_id: u64,
    /// Beneficiary of locally produced blocks
    pub coinbase: Address,
    pub difficulty: U256,
    pub sealer: SealerConfig,
    pub max_block_transactions: usize,
    pub pool: PoolConfig,
    /// Initial balances written with the genesis block
    pub genesis: BTreeMap<Address, U256>,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("powchain_data"),
            chain_id: 1,
            coinbase: Address::default(),
            difficulty: U256::from(1u64 << 16),
            sealer: SealerConfig::default(),
            max_block_transactions: 1_000,
            pool: PoolConfig::default(),
            genesis: BTreeMap::new(),
            log_filter: "info".to_string(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty.is_zero() {
            return Err(ConfigError::Invalid("difficulty must be non-zero".to_string()));
        }
        if self.max_block_transactions == 0 {
            return Err(ConfigError::Invalid("max_block_transactions must be positive".to_string()));
        }
        if self.pool.max_pending == 0 || self.pool.max_pending_per_sender == 0 {
            return Err(ConfigError::Invalid("mempool limits must be positive".to_string()));
        }
        Ok(())
    }
}

/// Installs the global `fmt` subscriber. `RUST_LOG` takes precedence over
/// `default_filter`.
pub fn init_logging(default_filter: &str) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| ConfigError::Invalid(format!("log filter {default_filter:?}: {e}")))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| ConfigError::Invalid(format!("logging already initialised: {e}")))
}
