//! Configuration for smp-economy

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::EconomyError;

/// Default database location
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("smp-economy")
        .join("economy.db")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EconomyConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Flat fee charged for every new claim
    #[serde(default = "default_base_claim_fee", alias = "baseClaimFee")]
    pub base_claim_fee: Decimal,

    /// Additional fee per claimed chunk
    #[serde(default = "default_per_chunk_fee", alias = "perChunkFee")]
    pub per_chunk_fee: Decimal,

    /// Daily tax charged per claimed chunk
    #[serde(default = "default_daily_tax_per_chunk", alias = "dailyTaxPerChunk")]
    pub daily_tax_per_chunk: Decimal,

    /// Balance given to an account on first touch
    #[serde(default = "default_starting_balance", alias = "defaultStartingBalance")]
    pub default_starting_balance: Decimal,

    /// Balance cache flush interval in seconds
    #[serde(default = "default_balance_flush", alias = "balanceFlushIntervalSeconds")]
    pub balance_flush_interval_secs: u64,

    /// Claim cache sync interval in seconds
    #[serde(default = "default_territory_flush", alias = "territoryFlushIntervalSeconds")]
    pub territory_flush_interval_secs: u64,

    /// UTC hour of the daily tax sweep
    #[serde(default)]
    pub tax_collection_hour: u32,

    /// UTC minute of the daily tax sweep
    #[serde(default)]
    pub tax_collection_minute: u32,

    /// Arrears above this many days of tax trigger the arrears policy
    #[serde(default = "default_arrears_multiple")]
    pub arrears_revocation_multiple: u32,
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_base_claim_fee() -> Decimal {
    Decimal::new(10000, 2)
}

fn default_per_chunk_fee() -> Decimal {
    Decimal::new(1000, 2)
}

fn default_daily_tax_per_chunk() -> Decimal {
    Decimal::new(100, 2)
}

fn default_starting_balance() -> Decimal {
    Decimal::new(10000, 2)
}

fn default_balance_flush() -> u64 {
    300
}

fn default_territory_flush() -> u64 {
    1800
}

fn default_arrears_multiple() -> u32 {
    7
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            base_claim_fee: default_base_claim_fee(),
            per_chunk_fee: default_per_chunk_fee(),
            daily_tax_per_chunk: default_daily_tax_per_chunk(),
            default_starting_balance: default_starting_balance(),
            balance_flush_interval_secs: default_balance_flush(),
            territory_flush_interval_secs: default_territory_flush(),
            tax_collection_hour: 0,
            tax_collection_minute: 0,
            arrears_revocation_multiple: default_arrears_multiple(),
        }
    }
}

impl EconomyConfig {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EconomyError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| EconomyError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), EconomyError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| EconomyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<(), EconomyError> {
        let fees = [
            ("base_claim_fee", self.base_claim_fee),
            ("per_chunk_fee", self.per_chunk_fee),
            ("daily_tax_per_chunk", self.daily_tax_per_chunk),
            ("default_starting_balance", self.default_starting_balance),
        ];
        for (name, value) in fees {
            if value < Decimal::ZERO {
                return Err(EconomyError::Config(format!("{} must not be negative", name)));
            }
        }

        if self.pool_size == 0 {
            return Err(EconomyError::Config("pool_size must be at least 1".into()));
        }
        if self.balance_flush_interval_secs == 0 || self.territory_flush_interval_secs == 0 {
            return Err(EconomyError::Config("flush intervals must be positive".into()));
        }
        if self.tax_collection_hour > 23 || self.tax_collection_minute > 59 {
            return Err(EconomyError::Config(format!(
                "invalid tax collection time {:02}:{:02}",
                self.tax_collection_hour, self.tax_collection_minute
            )));
        }

        Ok(())
    }

    pub fn balance_flush_interval(&self) -> Duration {
        Duration::from_secs(self.balance_flush_interval_secs)
    }

    pub fn territory_flush_interval(&self) -> Duration {
        Duration::from_secs(self.territory_flush_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}
