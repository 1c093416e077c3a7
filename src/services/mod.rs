//! Service layer for smp-economy
//!
//! Services own the authoritative in-memory state and write it back to the
//! durable store in the background.
//!
//! ## Architecture
//!
//! ```text
//! Game command handlers / quest system
//!     ↓
//! Service Layer (ledger, territory)
//!     ↓
//! DurableStore (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod events;
pub mod ledger;
pub mod territory;

// Re-exports
pub use events::{EconomyEvent, EventBus, NotificationSink};
pub use ledger::BalanceLedger;
pub use territory::{ArrearsPolicy, ClaimPricing, LogOnlyArrearsPolicy, TaxSweepSummary, TerritoryRegistry};

use std::sync::Arc;

use crate::config::EconomyConfig;
use crate::db::DurableStore;

/// Service container for dependency injection
///
/// Holds both services over one shared store and event bus.
pub struct EconomyServices {
    pub ledger: Arc<BalanceLedger>,
    pub territory: Arc<TerritoryRegistry>,
    pub events: Arc<EventBus>,
}

impl EconomyServices {
    /// Start all services with a shared store
    pub fn start(store: Arc<dyn DurableStore>, config: &EconomyConfig) -> Self {
        let events = Arc::new(EventBus::new());
        let sink: Arc<dyn NotificationSink> = events.clone();

        let ledger = BalanceLedger::start(store.clone(), sink.clone(), config);
        let territory = TerritoryRegistry::start(store, ledger.clone(), sink, config);

        Self {
            ledger,
            territory,
            events,
        }
    }

    /// Stop territory work first so no tax debit races the final balance flush
    pub async fn shutdown(&self) {
        self.territory.shutdown().await;
        self.ledger.shutdown().await;
    }
}
