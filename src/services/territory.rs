//! Territory registry - claimed regions, membership and daily tax
//!
//! Claims are cached by id. Claim creation is serialized per world: the
//! overlap check, the fee debit and the insert all happen while the world's
//! creation lock is held, and the store re-checks overlap inside its insert.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::claim::{
    Claim, ChunkRect, ClaimFailure, ClaimId, ClaimPermission, ClaimResult, ClaimTaxState, PermissionLevel,
};
use crate::config::EconomyConfig;
use crate::db::{run_blocking, DurableStore};
use crate::error::EconomyError;
use crate::services::events::{EconomyEvent, NotificationSink};
use crate::services::ledger::BalanceLedger;
use crate::transaction::TransactionKind;
use crate::PlayerId;

/// Called when a claim's unpaid tax passes the revocation threshold
pub trait ArrearsPolicy: Send + Sync {
    fn on_arrears_exceeded(&self, claim_id: ClaimId, owner: PlayerId, arrears: Decimal);
}

/// Default policy: protection is never revoked, the event is only logged
pub struct LogOnlyArrearsPolicy;

impl ArrearsPolicy for LogOnlyArrearsPolicy {
    fn on_arrears_exceeded(&self, claim_id: ClaimId, owner: PlayerId, arrears: Decimal) {
        warn!(
            claim_id,
            owner = %owner,
            arrears = %arrears,
            "Claim arrears over threshold, protection revocation not enforced"
        );
    }
}

/// Fee and tax constants applied to claims
#[derive(Debug, Clone)]
pub struct ClaimPricing {
    pub base_fee: Decimal,
    pub per_chunk_fee: Decimal,
    pub daily_tax_per_chunk: Decimal,
    pub arrears_multiple: u32,
}

impl ClaimPricing {
    pub fn from_config(config: &EconomyConfig) -> Self {
        Self {
            base_fee: config.base_claim_fee,
            per_chunk_fee: config.per_chunk_fee,
            daily_tax_per_chunk: config.daily_tax_per_chunk,
            arrears_multiple: config.arrears_revocation_multiple,
        }
    }

    /// `None` when the fee does not fit in a `Decimal`
    pub fn creation_cost(&self, rect: &ChunkRect) -> Option<Decimal> {
        self.per_chunk_fee
            .checked_mul(Decimal::from(rect.chunk_count()))?
            .checked_add(self.base_fee)
    }

    pub fn daily_tax(&self, rect: &ChunkRect) -> Option<Decimal> {
        self.daily_tax_per_chunk.checked_mul(Decimal::from(rect.chunk_count()))
    }

    pub fn arrears_limit(&self, daily_tax: Decimal) -> Decimal {
        daily_tax
            .checked_mul(Decimal::from(self.arrears_multiple))
            .unwrap_or(Decimal::MAX)
    }
}

/// Outcome counts of one tax sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaxSweepSummary {
    pub collected: usize,
    pub delinquent: usize,
    pub errors: usize,
}

pub struct TerritoryRegistry {
    store: Arc<dyn DurableStore>,
    ledger: Arc<BalanceLedger>,
    events: Arc<dyn NotificationSink>,
    pricing: ClaimPricing,
    arrears_policy: Arc<dyn ArrearsPolicy>,
    claims: DashMap<ClaimId, Claim>,
    world_locks: DashMap<String, Arc<Mutex<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl TerritoryRegistry {
    /// Create the registry and start its cache sync and daily tax tasks
    pub fn start(
        store: Arc<dyn DurableStore>,
        ledger: Arc<BalanceLedger>,
        events: Arc<dyn NotificationSink>,
        config: &EconomyConfig,
    ) -> Arc<Self> {
        Self::start_with_policy(store, ledger, events, config, Arc::new(LogOnlyArrearsPolicy))
    }

    pub fn start_with_policy(
        store: Arc<dyn DurableStore>,
        ledger: Arc<BalanceLedger>,
        events: Arc<dyn NotificationSink>,
        config: &EconomyConfig,
        arrears_policy: Arc<dyn ArrearsPolicy>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(Self {
            store,
            ledger,
            events,
            pricing: ClaimPricing::from_config(config),
            arrears_policy,
            claims: DashMap::new(),
            world_locks: DashMap::new(),
            shutdown_tx,
            tasks: StdMutex::new(Vec::new()),
        });

        let sync = registry.spawn_sync_loop(config.territory_flush_interval());
        let taxes = registry.spawn_tax_loop(config.tax_collection_hour, config.tax_collection_minute);
        if let Ok(mut tasks) = registry.tasks.lock() {
            tasks.push(sync);
            tasks.push(taxes);
        }

        info!(
            tax_time = %format!("{:02}:{:02}", config.tax_collection_hour, config.tax_collection_minute),
            "Territory registry started"
        );
        registry
    }

    pub fn pricing(&self) -> &ClaimPricing {
        &self.pricing
    }

    // =========================================================================
    // Claims
    // =========================================================================

    /// Charge the owner and create a claim over a free region
    pub async fn create_claim(
        &self,
        owner: PlayerId,
        world: &str,
        min_x: i32,
        min_z: i32,
        max_x: i32,
        max_z: i32,
    ) -> ClaimResult {
        let rect = match ChunkRect::new(min_x, min_z, max_x, max_z) {
            Ok(rect) => rect,
            Err(e) => return ClaimResult::failure(ClaimFailure::InvalidRegion, e.to_string()),
        };
        let (Some(cost), Some(daily_tax)) = (self.pricing.creation_cost(&rect), self.pricing.daily_tax(&rect)) else {
            return ClaimResult::failure(ClaimFailure::InvalidRegion, "Region too large to price");
        };

        let world_lock = self.world_lock(world);
        let _creating = world_lock.lock().await;

        match self.region_taken(world, &rect).await {
            Ok(false) => {}
            Ok(true) => {
                return ClaimResult::failure(ClaimFailure::Overlap, "Region overlaps an existing claim")
            }
            Err(e) => {
                error!(world = %world, error = %e, "Overlap check failed");
                return ClaimResult::failure(ClaimFailure::Store, "Could not check region availability");
            }
        }

        let charged = if cost > Decimal::ZERO {
            self.ledger
                .debit(owner, cost, TransactionKind::Spend, "Territory claim fee")
                .await
        } else {
            Ok(())
        };
        if let Err(e) = charged {
            return match e {
                EconomyError::InsufficientFunds { .. } => ClaimResult::failure(
                    ClaimFailure::InsufficientFunds,
                    format!("Insufficient funds. Required: {}", cost),
                ),
                other => {
                    error!(owner = %owner, error = %other, "Claim fee debit failed");
                    ClaimResult::failure(ClaimFailure::Store, "Could not charge the claim fee")
                }
            };
        }

        let created_at = Utc::now();
        let world_name = world.to_string();
        let claim_id = match run_blocking(&self.store, move |store| {
            store.insert_claim(owner, &world_name, &rect, &created_at)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                self.refund(owner, cost).await;
                return match e {
                    EconomyError::ClaimOverlap(_) => {
                        ClaimResult::failure(ClaimFailure::Overlap, "Region overlaps an existing claim")
                    }
                    other => {
                        error!(owner = %owner, error = %other, "Claim insert failed");
                        ClaimResult::failure(ClaimFailure::Store, "Could not save the claim")
                    }
                };
            }
        };

        if let Err(e) = run_blocking(&self.store, move |store| {
            store.insert_claim_tax(claim_id, daily_tax, &created_at)
        })
        .await
        {
            error!(claim_id, error = %e, "Failed to create claim tax row");
        }

        let claim = Claim {
            id: claim_id,
            owner,
            world: world.to_string(),
            rect,
            created_at,
        };
        self.claims.insert(claim_id, claim.clone());
        self.events.publish(EconomyEvent::TerritoryChanged {
            player: owner,
            owner_name: Some(owner.to_string()),
            claim_name: Some(claim.display_name()),
        });

        info!(
            claim_id,
            owner = %owner,
            chunks = rect.chunk_count(),
            cost = %cost,
            "Created claim"
        );
        ClaimResult::success(claim, format!("Territory claimed. Cost: {}", cost))
    }

    /// Claim containing the chunk, from cache or store. Store errors are
    /// logged and reported as no claim.
    pub async fn get_claim_at(&self, world: &str, chunk_x: i32, chunk_z: i32) -> Option<Claim> {
        if let Some(claim) = self
            .claims
            .iter()
            .find(|entry| entry.value().contains(world, chunk_x, chunk_z))
            .map(|entry| entry.value().clone())
        {
            return Some(claim);
        }

        let world_name = world.to_string();
        match run_blocking(&self.store, move |store| {
            store.load_claim_containing(&world_name, chunk_x, chunk_z)
        })
        .await
        {
            Ok(Some(claim)) => {
                self.claims.insert(claim.id, claim.clone());
                Some(claim)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(world = %world, chunk_x, chunk_z, error = %e, "Claim lookup failed");
                None
            }
        }
    }

    /// Effective permission of a player at a chunk
    pub async fn get_player_permission(
        &self,
        player: PlayerId,
        world: &str,
        chunk_x: i32,
        chunk_z: i32,
    ) -> ClaimPermission {
        let Some(claim) = self.get_claim_at(world, chunk_x, chunk_z).await else {
            return ClaimPermission::None;
        };

        if claim.owner == player {
            return ClaimPermission::Owner;
        }

        let claim_id = claim.id;
        match run_blocking(&self.store, move |store| store.load_claim_member(claim_id, player)).await {
            Ok(Some(member)) => member.level.into(),
            Ok(None) => ClaimPermission::None,
            Err(e) => {
                warn!(claim_id, player = %player, error = %e, "Member lookup failed");
                ClaimPermission::None
            }
        }
    }

    /// Add a member or overwrite their level. Callers decide who may do this.
    pub async fn add_claim_member(
        &self,
        claim_id: ClaimId,
        member: PlayerId,
        level: PermissionLevel,
    ) -> Result<(), EconomyError> {
        let added_at = Utc::now();
        let written = run_blocking(&self.store, move |store| {
            store.upsert_claim_member(claim_id, member, level, &added_at)
        })
        .await?;

        if !written {
            return Err(EconomyError::Internal(format!(
                "membership upsert for claim {} affected no rows",
                claim_id
            )));
        }
        debug!(claim_id, member = %member, level = %level, "Claim member set");
        Ok(())
    }

    pub async fn remove_claim_member(&self, claim_id: ClaimId, member: PlayerId) -> Result<bool, EconomyError> {
        run_blocking(&self.store, move |store| store.remove_claim_member(claim_id, member)).await
    }

    /// Delete a claim with its members and tax state
    pub async fn delete_claim(&self, claim_id: ClaimId) -> Result<(), EconomyError> {
        let claim = run_blocking(&self.store, move |store| store.load_claim(claim_id))
            .await?
            .ok_or(EconomyError::ClaimNotFound(claim_id))?;

        let world_lock = self.world_lock(&claim.world);
        let _guard = world_lock.lock().await;

        if !run_blocking(&self.store, move |store| store.delete_claim(claim_id)).await? {
            return Err(EconomyError::ClaimNotFound(claim_id));
        }
        self.claims.remove(&claim_id);

        self.events.publish(EconomyEvent::TerritoryChanged {
            player: claim.owner,
            owner_name: None,
            claim_name: None,
        });
        info!(claim_id, owner = %claim.owner, "Deleted claim");
        Ok(())
    }

    pub async fn claims_owned_by(&self, owner: PlayerId) -> Result<Vec<Claim>, EconomyError> {
        run_blocking(&self.store, move |store| store.load_claims_owned_by(owner)).await
    }

    pub async fn claim_tax(&self, claim_id: ClaimId) -> Result<Option<ClaimTaxState>, EconomyError> {
        run_blocking(&self.store, move |store| store.load_claim_tax(claim_id)).await
    }

    pub fn cached_claims(&self) -> usize {
        self.claims.len()
    }

    // =========================================================================
    // Taxes
    // =========================================================================

    /// Collect every tax that is due now
    pub async fn collect_daily_taxes(&self) -> TaxSweepSummary {
        self.collect_taxes_at(Utc::now()).await
    }

    /// Collect taxes last paid at least one day before `as_of`
    pub async fn collect_taxes_at(&self, as_of: DateTime<Utc>) -> TaxSweepSummary {
        info!("Starting daily territory tax collection");
        let mut summary = TaxSweepSummary::default();

        let due = match run_blocking(&self.store, move |store| store.due_tax_rows(&as_of)).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to load due taxes");
                summary.errors += 1;
                return summary;
            }
        };

        for row in due {
            let claim_id = row.claim_id;
            let paid = if row.daily_tax <= Decimal::ZERO {
                Ok(())
            } else {
                self.ledger
                    .debit(
                        row.owner,
                        row.daily_tax,
                        TransactionKind::Tax,
                        &format!("Daily territory tax (claim #{})", claim_id),
                    )
                    .await
            };

            let outcome = match paid {
                Ok(()) => {
                    debug!(claim_id, tax = %row.daily_tax, "Tax collected");
                    summary.collected += 1;
                    run_blocking(&self.store, move |store| store.mark_tax_paid(claim_id, &as_of)).await
                }
                Err(e) => {
                    let arrears = row.arrears.saturating_add(row.daily_tax);
                    warn!(claim_id, arrears = %arrears, reason = %e, "Tax collection failed, arrears accrued");
                    summary.delinquent += 1;

                    if arrears > self.pricing.arrears_limit(row.daily_tax) {
                        self.arrears_policy.on_arrears_exceeded(claim_id, row.owner, arrears);
                    }
                    run_blocking(&self.store, move |store| store.set_tax_arrears(claim_id, arrears)).await
                }
            };

            if let Err(e) = outcome {
                error!(claim_id, error = %e, "Failed to record tax outcome");
                summary.errors += 1;
            }
        }

        info!(
            collected = summary.collected,
            delinquent = summary.delinquent,
            errors = summary.errors,
            "Daily territory tax collection finished"
        );
        summary
    }

    // =========================================================================
    // Cache Sync & Shutdown
    // =========================================================================

    /// Drop cached claims that no longer exist in the store
    pub async fn sync_cache(&self) -> Result<usize, EconomyError> {
        let cached: Vec<ClaimId> = self.claims.iter().map(|entry| *entry.key()).collect();
        if cached.is_empty() {
            return Ok(0);
        }

        let lookup = cached.clone();
        let existing = run_blocking(&self.store, move |store| store.existing_claim_ids(&lookup)).await?;

        let mut evicted = 0;
        for id in cached {
            if !existing.contains(&id) && self.claims.remove(&id).is_some() {
                evicted += 1;
            }
        }

        debug!(cached = self.claims.len(), evicted, "Territory cache synced");
        Ok(evicted)
    }

    /// Stop scheduled work and sync the cache one last time
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }

        if let Err(e) = self.sync_cache().await {
            warn!(error = %e, "Final territory cache sync failed");
        }
        info!(cached = self.claims.len(), "Territory registry shut down");
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn world_lock(&self, world: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.world_locks.entry(world.to_string()).or_default().value())
    }

    async fn region_taken(&self, world: &str, rect: &ChunkRect) -> Result<bool, EconomyError> {
        if self.claims.iter().any(|entry| entry.value().overlaps(world, rect)) {
            return Ok(true);
        }

        let world_name = world.to_string();
        let rect = *rect;
        let count = run_blocking(&self.store, move |store| store.overlap_count(&world_name, &rect)).await?;
        Ok(count > 0)
    }

    async fn refund(&self, owner: PlayerId, cost: Decimal) {
        if cost <= Decimal::ZERO {
            return;
        }
        if let Err(e) = self
            .ledger
            .credit(owner, cost, TransactionKind::Earn, "Territory claim fee refund")
            .await
        {
            error!(owner = %owner, cost = %cost, error = %e, "Claim fee refund failed");
        }
    }

    fn spawn_sync_loop(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = registry.sync_cache().await {
                            warn!(error = %e, "Territory cache sync failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("Territory sync loop shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_tax_loop(self: &Arc<Self>, hour: u32, minute: u32) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let wait = until_next_daily_run(Utc::now(), hour, minute);
                debug!(wait_secs = wait.as_secs(), "Next tax collection scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        registry.collect_daily_taxes().await;
                    }
                    _ = shutdown.recv() => {
                        debug!("Tax loop shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Time from `now` until the next `hour:minute` UTC, strictly in the future
pub fn until_next_daily_run(now: DateTime<Utc>, hour: u32, minute: u32) -> Duration {
    let at = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default();
    let mut next = now.date_naive().and_time(at).and_utc();
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or_default()
}
