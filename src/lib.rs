//! SMP Economy - balance ledger and territory registry for a game server
//!
//! Both services keep authoritative state in memory and write it back to
//! SQLite in the background.
//!
//! ## Architecture
//!
//! - **Balance ledger**: Per-player balances, transfers, append-only history
//! - **Territory registry**: Chunk-rectangle claims, membership, daily tax
//! - **Durable store**: Pooled SQLite via diesel
//!
//! ## Storage Layout
//!
//! ```text
//! <data_local_dir>/smp-economy/
//! └── economy.db             # Balances, ledger, claims, members, tax
//! ```

pub mod claim;
pub mod config;
pub mod db;
pub mod error;
pub mod services;
pub mod transaction;

/// Stable player identifier
pub type PlayerId = uuid::Uuid;

// Re-exports
pub use claim::{Claim, ChunkRect, ClaimAction, ClaimId, ClaimPermission, ClaimResult, PermissionLevel};
pub use config::EconomyConfig;
pub use db::{DurableStore, SqliteStore};
pub use error::EconomyError;
pub use services::{BalanceLedger, EconomyEvent, EconomyServices, EventBus, TaxSweepSummary, TerritoryRegistry};
pub use transaction::{TransactionKind, TransactionRecord};
