//! Balance ledger - write-back cache of account balances
//!
//! The cache is the source of truth for every account it holds. Each account
//! slot carries its own async mutex, and every read-modify-write holds it, so
//! concurrent credits and debits of one account never lose updates. Transfers
//! lock both slots in ascending id order.
//!
//! Durable writes are deferred:
//! - transaction records go through a channel to a single writer task
//! - balances are upserted in one batch every flush interval

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EconomyConfig;
use crate::db::{run_blocking, DurableStore};
use crate::error::EconomyError;
use crate::services::events::{EconomyEvent, NotificationSink};
use crate::transaction::{TransactionKind, TransactionRecord};
use crate::PlayerId;

/// Cached balance; `None` until loaded from the store
type AccountSlot = Arc<Mutex<Option<Decimal>>>;

pub struct BalanceLedger {
    store: Arc<dyn DurableStore>,
    events: Arc<dyn NotificationSink>,
    accounts: DashMap<PlayerId, AccountSlot>,
    starting_balance: Decimal,
    tx_log: StdMutex<Option<mpsc::UnboundedSender<TransactionRecord>>>,
    tx_writer: StdMutex<Option<JoinHandle<()>>>,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl BalanceLedger {
    /// Create the ledger and start its transaction writer and flush loop.
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: Arc<dyn DurableStore>,
        events: Arc<dyn NotificationSink>,
        config: &EconomyConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);
        let writer = spawn_transaction_writer(Arc::clone(&store), rx);

        let ledger = Arc::new(Self {
            store,
            events,
            accounts: DashMap::new(),
            starting_balance: config.default_starting_balance,
            tx_log: StdMutex::new(Some(tx)),
            tx_writer: StdMutex::new(Some(writer)),
            flush_task: StdMutex::new(None),
            shutdown_tx,
        });

        let flush = ledger.spawn_flush_loop(config.balance_flush_interval());
        if let Ok(mut slot) = ledger.flush_task.lock() {
            *slot = Some(flush);
        }

        info!(
            starting_balance = %config.default_starting_balance,
            flush_secs = config.balance_flush_interval_secs,
            "Balance ledger started"
        );
        ledger
    }

    // =========================================================================
    // Read Operations
    // =========================================================================

    /// Current balance, loading or creating the account on first touch.
    /// Store failures are logged and reported as zero; the zero is not cached.
    pub async fn get_balance(&self, player: PlayerId) -> Decimal {
        let slot = self.slot(player);
        let mut cached = slot.lock().await;

        if let Some(balance) = *cached {
            debug!(player = %player, "Balance cache hit");
            return balance;
        }

        match self.ensure_loaded(player, &mut cached).await {
            Ok(balance) => balance,
            Err(e) => {
                error!(player = %player, error = %e, "Failed to load balance");
                Decimal::ZERO
            }
        }
    }

    /// Ledger history touching an account, newest first
    pub async fn transaction_history(
        &self,
        player: PlayerId,
        limit: i64,
    ) -> Result<Vec<TransactionRecord>, EconomyError> {
        run_blocking(&self.store, move |store| store.load_transactions(player, limit)).await
    }

    /// Number of accounts currently held in the cache
    pub fn cached_accounts(&self) -> usize {
        self.accounts.len()
    }

    // =========================================================================
    // Write Operations
    // =========================================================================

    /// Overwrite a balance. Logs an `admin_set` record with the delta.
    pub async fn set_balance(
        &self,
        player: PlayerId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), EconomyError> {
        if amount < Decimal::ZERO {
            return Err(EconomyError::InvalidAmount(amount));
        }

        let slot = self.slot(player);
        let mut cached = slot.lock().await;
        let previous = self.ensure_loaded(player, &mut cached).await?;
        *cached = Some(amount);
        drop(cached);

        self.record(TransactionRecord::new(
            None,
            Some(player),
            amount - previous,
            TransactionKind::AdminSet,
            reason,
        ));
        self.announce(player, amount);
        Ok(())
    }

    /// Credit an account, logged as `earn`
    pub async fn add_balance(&self, player: PlayerId, amount: Decimal, reason: &str) -> Result<(), EconomyError> {
        self.credit(player, amount, TransactionKind::Earn, reason).await
    }

    /// Debit an account, logged as `spend`. Never takes a balance below zero.
    pub async fn subtract_balance(&self, player: PlayerId, amount: Decimal, reason: &str) -> Result<(), EconomyError> {
        self.debit(player, amount, TransactionKind::Spend, reason).await
    }

    /// Credit an account, logged as `quest_reward`
    pub async fn grant_quest_reward(&self, player: PlayerId, amount: Decimal, reason: &str) -> Result<(), EconomyError> {
        self.credit(player, amount, TransactionKind::QuestReward, reason).await
    }

    /// Move money between two distinct accounts
    pub async fn transfer_money(
        &self,
        from: PlayerId,
        to: PlayerId,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), EconomyError> {
        if amount <= Decimal::ZERO {
            return Err(EconomyError::InvalidAmount(amount));
        }
        if from == to {
            return Err(EconomyError::SelfTransfer);
        }

        let (low, high) = if from < to { (from, to) } else { (to, from) };
        let low_slot = self.slot(low);
        let high_slot = self.slot(high);
        let mut low_guard = low_slot.lock().await;
        let mut high_guard = high_slot.lock().await;
        let (from_cached, to_cached) = if from < to {
            (&mut *low_guard, &mut *high_guard)
        } else {
            (&mut *high_guard, &mut *low_guard)
        };

        let from_balance = self.ensure_loaded(from, from_cached).await?;
        let to_balance = self.ensure_loaded(to, to_cached).await?;

        if from_balance < amount {
            return Err(EconomyError::InsufficientFunds {
                required: amount,
                available: from_balance,
            });
        }

        let from_after = from_balance - amount;
        let to_after = to_balance + amount;
        *from_cached = Some(from_after);
        *to_cached = Some(to_after);
        drop(low_guard);
        drop(high_guard);

        self.record(TransactionRecord::new(
            Some(from),
            Some(to),
            amount,
            TransactionKind::Transfer,
            reason,
        ));
        self.announce(from, from_after);
        self.announce(to, to_after);
        Ok(())
    }

    pub(crate) async fn credit(
        &self,
        player: PlayerId,
        amount: Decimal,
        kind: TransactionKind,
        reason: &str,
    ) -> Result<(), EconomyError> {
        if amount <= Decimal::ZERO {
            return Err(EconomyError::InvalidAmount(amount));
        }

        let slot = self.slot(player);
        let mut cached = slot.lock().await;
        let balance = self.ensure_loaded(player, &mut cached).await? + amount;
        *cached = Some(balance);
        drop(cached);

        self.record(TransactionRecord::new(None, Some(player), amount, kind, reason));
        self.announce(player, balance);
        Ok(())
    }

    pub(crate) async fn debit(
        &self,
        player: PlayerId,
        amount: Decimal,
        kind: TransactionKind,
        reason: &str,
    ) -> Result<(), EconomyError> {
        if amount <= Decimal::ZERO {
            return Err(EconomyError::InvalidAmount(amount));
        }

        let slot = self.slot(player);
        let mut cached = slot.lock().await;
        let current = self.ensure_loaded(player, &mut cached).await?;
        if current < amount {
            return Err(EconomyError::InsufficientFunds {
                required: amount,
                available: current,
            });
        }

        let balance = current - amount;
        *cached = Some(balance);
        drop(cached);

        self.record(TransactionRecord::new(Some(player), None, amount, kind, reason));
        self.announce(player, balance);
        Ok(())
    }

    // =========================================================================
    // Flush & Shutdown
    // =========================================================================

    /// Upsert every cached balance in one batch. The cache stays authoritative
    /// when this fails; the next flush retries.
    pub async fn flush(&self) -> Result<usize, EconomyError> {
        let slots: Vec<(PlayerId, AccountSlot)> = self
            .accounts
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut batch = Vec::with_capacity(slots.len());
        for (player, slot) in slots {
            if let Some(balance) = *slot.lock().await {
                batch.push((player, balance));
            }
        }

        if batch.is_empty() {
            return Ok(0);
        }

        let count = run_blocking(&self.store, move |store| store.upsert_balances(&batch)).await?;
        debug!(accounts = count, "Flushed balance cache");
        Ok(count)
    }

    /// Final flush, then drain pending transaction records
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = take_handle(&self.flush_task) {
            let _ = handle.await;
        }

        match self.flush().await {
            Ok(count) => info!(accounts = count, "Final balance flush complete"),
            Err(e) => error!(error = %e, "Final balance flush failed"),
        }

        // Dropping the sender lets the writer finish the queue and exit
        if let Ok(mut tx) = self.tx_log.lock() {
            tx.take();
        }
        if let Some(handle) = take_handle(&self.tx_writer) {
            if let Err(e) = handle.await {
                error!(error = %e, "Transaction writer task failed");
            }
        }

        info!("Balance ledger shut down");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn slot(&self, player: PlayerId) -> AccountSlot {
        Arc::clone(self.accounts.entry(player).or_default().value())
    }

    /// Fill an empty slot from the store, creating the account if needed
    async fn ensure_loaded(
        &self,
        player: PlayerId,
        cached: &mut Option<Decimal>,
    ) -> Result<Decimal, EconomyError> {
        if let Some(balance) = *cached {
            return Ok(balance);
        }

        let starting_balance = self.starting_balance;
        let balance = run_blocking(&self.store, move |store| match store.load_balance(player)? {
            Some(balance) => Ok(balance),
            None => store.create_account(player, starting_balance),
        })
        .await?;

        *cached = Some(balance);
        Ok(balance)
    }

    fn record(&self, record: TransactionRecord) {
        let sent = match self.tx_log.lock() {
            Ok(tx) => match tx.as_ref() {
                Some(sender) => sender.send(record).is_ok(),
                None => false,
            },
            Err(_) => false,
        };
        if !sent {
            warn!("Transaction writer unavailable, record dropped");
        }
    }

    fn announce(&self, player: PlayerId, balance: Decimal) {
        self.events.publish(EconomyEvent::BalanceChanged { player, balance });
    }

    fn spawn_flush_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = ledger.flush().await {
                            warn!(error = %e, "Balance flush failed, retrying next interval");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Balance flush loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Append records in the order they were sent
fn spawn_transaction_writer(
    store: Arc<dyn DurableStore>,
    mut rx: mpsc::UnboundedReceiver<TransactionRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            let kind = record.kind;
            if let Err(e) = run_blocking(&store, move |s| s.append_transaction(&record)).await {
                error!(kind = %kind, error = %e, "Failed to append transaction record");
            }
        }
        debug!("Transaction writer drained");
    })
}

fn take_handle(slot: &StdMutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    slot.lock().ok().and_then(|mut handle| handle.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::services::events::EventBus;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn ledger() -> (Arc<BalanceLedger>, Arc<SqliteStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open_path(&dir.path().join("ledger.db"), 4, Duration::from_secs(5)).unwrap(),
        );
        let ledger = BalanceLedger::start(store.clone(), Arc::new(EventBus::new()), &EconomyConfig::default());
        (ledger, store, dir)
    }

    #[tokio::test]
    async fn test_new_account_gets_starting_balance_once() {
        let (ledger, store, _dir) = ledger();
        let player = Uuid::new_v4();

        assert_eq!(ledger.get_balance(player).await, dec!(100));
        assert_eq!(ledger.get_balance(player).await, dec!(100));
        assert_eq!(store.stats().unwrap().accounts, 1);
    }

    #[tokio::test]
    async fn test_rejects_non_positive_amounts() {
        let (ledger, _store, _dir) = ledger();
        let player = Uuid::new_v4();

        assert!(matches!(
            ledger.add_balance(player, Decimal::ZERO, "nothing").await,
            Err(EconomyError::InvalidAmount(_))
        ));
        assert!(ledger.subtract_balance(player, dec!(-5), "negative").await.is_err());
        assert!(ledger.set_balance(player, dec!(-0.01), "negative").await.is_err());
        assert_eq!(ledger.cached_accounts(), 0);
    }

    #[tokio::test]
    async fn test_subtract_more_than_balance_leaves_it_unchanged() {
        let (ledger, _store, _dir) = ledger();
        let player = Uuid::new_v4();

        let err = ledger.subtract_balance(player, dec!(100.01), "too much").await.unwrap_err();
        assert!(matches!(err, EconomyError::InsufficientFunds { .. }));
        assert_eq!(ledger.get_balance(player).await, dec!(100));

        ledger.subtract_balance(player, dec!(100), "everything").await.unwrap();
        assert_eq!(ledger.get_balance(player).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_set_balance_allows_zero() {
        let (ledger, _store, _dir) = ledger();
        let player = Uuid::new_v4();

        ledger.set_balance(player, Decimal::ZERO, "reset").await.unwrap();
        assert_eq!(ledger.get_balance(player).await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_self_transfer_always_fails() {
        let (ledger, _store, _dir) = ledger();
        let player = Uuid::new_v4();

        assert!(matches!(
            ledger.transfer_money(player, player, dec!(1), "loop").await,
            Err(EconomyError::SelfTransfer)
        ));
        assert_eq!(ledger.get_balance(player).await, dec!(100));
    }

    #[tokio::test]
    async fn test_flush_persists_cache() {
        let (ledger, store, _dir) = ledger();
        let player = Uuid::new_v4();

        ledger.add_balance(player, dec!(23.45), "quest").await.unwrap();
        assert_eq!(ledger.flush().await.unwrap(), 1);
        assert_eq!(store.load_balance(player).unwrap(), Some(dec!(123.45)));
    }

    #[tokio::test]
    async fn test_balance_changes_are_published() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open_path(&dir.path().join("ledger.db"), 2, Duration::from_secs(5)).unwrap(),
        );
        let bus = Arc::new(EventBus::new());
        let mut events = bus.subscribe();
        let ledger = BalanceLedger::start(store, bus.clone(), &EconomyConfig::default());
        let player = Uuid::new_v4();

        ledger.add_balance(player, dec!(5), "mining").await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            EconomyEvent::BalanceChanged {
                player,
                balance: dec!(105)
            }
        );
    }
}
