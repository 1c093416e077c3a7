//! SQLite durable store for balances, the transaction ledger and claims
//!
//! The balance ledger and territory registry treat their in-memory caches as
//! authoritative and reach the database only through [`DurableStore`].
//!
//! ## Tables
//!
//! - `balances` - One row per account (player id, balance, updated_at)
//! - `tx_ledger` - Append-only transaction history
//! - `claims` - Claimed chunk rectangles, unique per (world, rect)
//! - `claim_members` - Membership level per (claim, member)
//! - `claim_tax` - Daily tax, last payment and arrears per claim

pub mod balances;
pub mod claims;
pub mod models;
pub mod schema;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::claim::{Claim, ChunkRect, ClaimId, ClaimMember, ClaimTaxState, DueTax, PermissionLevel};
use crate::config::EconomyConfig;
use crate::error::EconomyError;
use crate::transaction::TransactionRecord;
use crate::PlayerId;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Operations the caches need from durable storage. Implementations block;
/// services call them through [`run_blocking`].
pub trait DurableStore: Send + Sync {
    /// Stored balance, `None` if the account has no row yet
    fn load_balance(&self, player: PlayerId) -> Result<Option<Decimal>, EconomyError>;
    /// Create the account unless it exists; returns the stored balance
    fn create_account(&self, player: PlayerId, starting_balance: Decimal) -> Result<Decimal, EconomyError>;
    fn upsert_balances(&self, batch: &[(PlayerId, Decimal)]) -> Result<usize, EconomyError>;
    fn append_transaction(&self, record: &TransactionRecord) -> Result<(), EconomyError>;
    fn load_transactions(&self, player: PlayerId, limit: i64) -> Result<Vec<TransactionRecord>, EconomyError>;

    fn load_claim_containing(&self, world: &str, chunk_x: i32, chunk_z: i32) -> Result<Option<Claim>, EconomyError>;
    fn load_claim(&self, claim_id: ClaimId) -> Result<Option<Claim>, EconomyError>;
    fn load_claims_owned_by(&self, owner: PlayerId) -> Result<Vec<Claim>, EconomyError>;
    fn existing_claim_ids(&self, ids: &[ClaimId]) -> Result<Vec<ClaimId>, EconomyError>;
    fn overlap_count(&self, world: &str, rect: &ChunkRect) -> Result<i64, EconomyError>;
    /// Fails with `ClaimOverlap` if the region is taken
    fn insert_claim(
        &self,
        owner: PlayerId,
        world: &str,
        rect: &ChunkRect,
        created_at: &DateTime<Utc>,
    ) -> Result<ClaimId, EconomyError>;
    fn delete_claim(&self, claim_id: ClaimId) -> Result<bool, EconomyError>;

    fn upsert_claim_member(
        &self,
        claim_id: ClaimId,
        member: PlayerId,
        level: PermissionLevel,
        added_at: &DateTime<Utc>,
    ) -> Result<bool, EconomyError>;
    fn load_claim_member(&self, claim_id: ClaimId, member: PlayerId) -> Result<Option<ClaimMember>, EconomyError>;
    fn remove_claim_member(&self, claim_id: ClaimId, member: PlayerId) -> Result<bool, EconomyError>;

    fn insert_claim_tax(&self, claim_id: ClaimId, daily_tax: Decimal, created_at: &DateTime<Utc>) -> Result<(), EconomyError>;
    fn load_claim_tax(&self, claim_id: ClaimId) -> Result<Option<ClaimTaxState>, EconomyError>;
    fn due_tax_rows(&self, as_of: &DateTime<Utc>) -> Result<Vec<DueTax>, EconomyError>;
    fn mark_tax_paid(&self, claim_id: ClaimId, paid_at: &DateTime<Utc>) -> Result<(), EconomyError>;
    fn set_tax_arrears(&self, claim_id: ClaimId, arrears: Decimal) -> Result<(), EconomyError>;
}

/// Run a store call on the blocking pool
pub async fn run_blocking<T, F>(store: &Arc<dyn DurableStore>, f: F) -> Result<T, EconomyError>
where
    F: FnOnce(&dyn DurableStore) -> Result<T, EconomyError> + Send + 'static,
    T: Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| EconomyError::Internal(format!("Store task failed: {}", e)))?
}

/// Pragmas applied to every pooled connection
#[derive(Debug)]
struct ConnectionPragmas {
    busy_timeout: Duration,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            self.busy_timeout.as_millis()
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Pooled SQLite implementation of [`DurableStore`]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open or create the database described by the config
    pub fn open(config: &EconomyConfig) -> Result<Self, EconomyError> {
        Self::open_path(&config.database_path, config.pool_size, config.connection_timeout())
    }

    pub fn open_path(path: &Path, pool_size: u32, connection_timeout: Duration) -> Result<Self, EconomyError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening SQLite database at {:?}", path);

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(connection_timeout)
            .connection_customizer(Box::new(ConnectionPragmas {
                busy_timeout: connection_timeout,
            }))
            .build(manager)?;

        let store = Self { pool };

        let mut conn = store.conn()?;
        conn.batch_execute("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| EconomyError::Internal(format!("Failed to set PRAGMA: {}", e)))?;
        schema::init_schema(&mut conn)?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<DbConn, EconomyError> {
        Ok(self.pool.get()?)
    }

    /// Row counts for diagnostics
    pub fn stats(&self) -> Result<StoreStats, EconomyError> {
        let mut conn = self.conn()?;
        Ok(StoreStats {
            accounts: balances::count_accounts(&mut conn)? as u64,
            transactions: balances::count_transactions(&mut conn)? as u64,
            claims: claims::count_claims(&mut conn)? as u64,
            members: claims::count_members(&mut conn)? as u64,
        })
    }
}

impl DurableStore for SqliteStore {
    fn load_balance(&self, player: PlayerId) -> Result<Option<Decimal>, EconomyError> {
        let mut conn = self.conn()?;
        balances::load_balance(&mut conn, player)
    }

    fn create_account(&self, player: PlayerId, starting_balance: Decimal) -> Result<Decimal, EconomyError> {
        let mut conn = self.conn()?;
        balances::create_account(&mut conn, player, starting_balance)
    }

    fn upsert_balances(&self, batch: &[(PlayerId, Decimal)]) -> Result<usize, EconomyError> {
        let mut conn = self.conn()?;
        balances::upsert_balances(&mut conn, batch)
    }

    fn append_transaction(&self, record: &TransactionRecord) -> Result<(), EconomyError> {
        let mut conn = self.conn()?;
        balances::append_transaction(&mut conn, record)
    }

    fn load_transactions(&self, player: PlayerId, limit: i64) -> Result<Vec<TransactionRecord>, EconomyError> {
        let mut conn = self.conn()?;
        balances::load_transactions(&mut conn, player, limit)
    }

    fn load_claim_containing(&self, world: &str, chunk_x: i32, chunk_z: i32) -> Result<Option<Claim>, EconomyError> {
        debug!(world = %world, chunk_x, chunk_z, "Claim lookup in store");
        let mut conn = self.conn()?;
        claims::load_claim_containing(&mut conn, world, chunk_x, chunk_z)
    }

    fn load_claim(&self, claim_id: ClaimId) -> Result<Option<Claim>, EconomyError> {
        let mut conn = self.conn()?;
        claims::load_claim(&mut conn, claim_id)
    }

    fn load_claims_owned_by(&self, owner: PlayerId) -> Result<Vec<Claim>, EconomyError> {
        let mut conn = self.conn()?;
        claims::load_claims_owned_by(&mut conn, owner)
    }

    fn existing_claim_ids(&self, ids: &[ClaimId]) -> Result<Vec<ClaimId>, EconomyError> {
        let mut conn = self.conn()?;
        claims::existing_claim_ids(&mut conn, ids)
    }

    fn overlap_count(&self, world: &str, rect: &ChunkRect) -> Result<i64, EconomyError> {
        let mut conn = self.conn()?;
        claims::overlap_count(&mut conn, world, rect)
    }

    fn insert_claim(
        &self,
        owner: PlayerId,
        world: &str,
        rect: &ChunkRect,
        created_at: &DateTime<Utc>,
    ) -> Result<ClaimId, EconomyError> {
        let mut conn = self.conn()?;
        claims::insert_claim(&mut conn, owner, world, rect, created_at)
    }

    fn delete_claim(&self, claim_id: ClaimId) -> Result<bool, EconomyError> {
        let mut conn = self.conn()?;
        claims::delete_claim(&mut conn, claim_id)
    }

    fn upsert_claim_member(
        &self,
        claim_id: ClaimId,
        member: PlayerId,
        level: PermissionLevel,
        added_at: &DateTime<Utc>,
    ) -> Result<bool, EconomyError> {
        let mut conn = self.conn()?;
        claims::upsert_claim_member(&mut conn, claim_id, member, level, added_at)
    }

    fn load_claim_member(&self, claim_id: ClaimId, member: PlayerId) -> Result<Option<ClaimMember>, EconomyError> {
        let mut conn = self.conn()?;
        claims::load_claim_member(&mut conn, claim_id, member)
    }

    fn remove_claim_member(&self, claim_id: ClaimId, member: PlayerId) -> Result<bool, EconomyError> {
        let mut conn = self.conn()?;
        claims::remove_claim_member(&mut conn, claim_id, member)
    }

    fn insert_claim_tax(&self, claim_id: ClaimId, daily_tax: Decimal, created_at: &DateTime<Utc>) -> Result<(), EconomyError> {
        let mut conn = self.conn()?;
        claims::insert_claim_tax(&mut conn, claim_id, daily_tax, created_at)
    }

    fn load_claim_tax(&self, claim_id: ClaimId) -> Result<Option<ClaimTaxState>, EconomyError> {
        let mut conn = self.conn()?;
        claims::load_claim_tax(&mut conn, claim_id)
    }

    fn due_tax_rows(&self, as_of: &DateTime<Utc>) -> Result<Vec<DueTax>, EconomyError> {
        let mut conn = self.conn()?;
        claims::due_tax_rows(&mut conn, as_of)
    }

    fn mark_tax_paid(&self, claim_id: ClaimId, paid_at: &DateTime<Utc>) -> Result<(), EconomyError> {
        let mut conn = self.conn()?;
        claims::mark_tax_paid(&mut conn, claim_id, paid_at)
    }

    fn set_tax_arrears(&self, claim_id: ClaimId, arrears: Decimal) -> Result<(), EconomyError> {
        let mut conn = self.conn()?;
        claims::set_tax_arrears(&mut conn, claim_id, arrears)
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub accounts: u64,
    pub transactions: u64,
    pub claims: u64,
    pub members: u64,
}
