//! Error types for smp-economy

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EconomyError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(Decimal),

    #[error("Cannot transfer money to the same account")]
    SelfTransfer,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("Invalid region: ({min_x}, {min_z}) to ({max_x}, {max_z})")]
    InvalidRegion {
        min_x: i32,
        min_z: i32,
        max_x: i32,
        max_z: i32,
    },

    #[error("Region overlaps an existing claim in world {0}")]
    ClaimOverlap(String),

    #[error("Claim not found: {0}")]
    ClaimNotFound(i64),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EconomyError {
    /// True when the caller's request was refused (bad input or not enough
    /// money) rather than failing inside the store.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            EconomyError::InvalidAmount(_)
                | EconomyError::SelfTransfer
                | EconomyError::InsufficientFunds { .. }
                | EconomyError::InvalidRegion { .. }
                | EconomyError::ClaimOverlap(_)
                | EconomyError::ClaimNotFound(_)
        )
    }
}
