//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use diesel::sqlite::SqliteConnection;
use tracing::info;

use crate::error::EconomyError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

diesel::table! {
    balances (player_id) {
        player_id -> Text,
        balance -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    tx_ledger (id) {
        id -> BigInt,
        from_player -> Nullable<Text>,
        to_player -> Nullable<Text>,
        amount -> Text,
        kind -> Text,
        reason -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    claims (id) {
        id -> BigInt,
        owner_id -> Text,
        world -> Text,
        min_x -> Integer,
        min_z -> Integer,
        max_x -> Integer,
        max_z -> Integer,
        created_at -> Text,
    }
}

diesel::table! {
    claim_members (claim_id, member_id) {
        claim_id -> BigInt,
        member_id -> Text,
        permission_level -> Text,
        added_at -> Text,
    }
}

diesel::table! {
    claim_tax (claim_id) {
        claim_id -> BigInt,
        daily_tax -> Text,
        last_paid_at -> Text,
        arrears -> Text,
    }
}

diesel::joinable!(claim_members -> claims (claim_id));
diesel::joinable!(claim_tax -> claims (claim_id));

diesel::allow_tables_to_appear_in_same_query!(balances, tx_ledger, claims, claim_members, claim_tax);

#[derive(QueryableByName)]
struct SchemaVersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), EconomyError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, EconomyError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .map_err(|e| EconomyError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let row = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result::<SchemaVersionRow>(conn)
        .optional()?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), EconomyError> {
    diesel::sql_query("DELETE FROM schema_version").execute(conn)?;
    diesel::sql_query("INSERT INTO schema_version (version) VALUES (?)")
        .bind::<Integer, _>(version)
        .execute(conn)?;
    Ok(())
}

fn create_tables(conn: &mut SqliteConnection) -> Result<(), EconomyError> {
    conn.batch_execute(LEDGER_SCHEMA)
        .map_err(|e| EconomyError::Internal(format!("Failed to create ledger tables: {}", e)))?;

    conn.batch_execute(TERRITORY_SCHEMA)
        .map_err(|e| EconomyError::Internal(format!("Failed to create territory tables: {}", e)))?;

    conn.batch_execute(INDEXES_SCHEMA)
        .map_err(|e| EconomyError::Internal(format!("Failed to create indexes: {}", e)))?;

    Ok(())
}

fn migrate_schema(conn: &mut SqliteConnection, from_version: i32) -> Result<(), EconomyError> {
    info!(from_version, "No migration steps registered");
    set_schema_version(conn, SCHEMA_VERSION)
}

/// Balances and the append-only transaction ledger
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS balances (
    player_id TEXT PRIMARY KEY NOT NULL,
    balance TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tx_ledger (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    from_player TEXT,
    to_player TEXT,
    amount TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('transfer', 'earn', 'spend', 'tax', 'quest_reward', 'admin_set')),
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Claims, memberships and tax state
const TERRITORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS claims (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    world TEXT NOT NULL,
    min_x INTEGER NOT NULL,
    min_z INTEGER NOT NULL,
    max_x INTEGER NOT NULL,
    max_z INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    CHECK (min_x <= max_x AND min_z <= max_z)
);

CREATE TABLE IF NOT EXISTS claim_members (
    claim_id INTEGER NOT NULL REFERENCES claims(id) ON DELETE CASCADE,
    member_id TEXT NOT NULL,
    permission_level TEXT NOT NULL DEFAULT 'member' CHECK (permission_level IN ('guest', 'member', 'admin')),
    added_at TEXT NOT NULL,
    PRIMARY KEY (claim_id, member_id)
);

CREATE TABLE IF NOT EXISTS claim_tax (
    claim_id INTEGER PRIMARY KEY NOT NULL REFERENCES claims(id) ON DELETE CASCADE,
    daily_tax TEXT NOT NULL,
    last_paid_at TEXT NOT NULL,
    arrears TEXT NOT NULL DEFAULT '0'
);
"#;

const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tx_ledger_from ON tx_ledger(from_player);
CREATE INDEX IF NOT EXISTS idx_tx_ledger_to ON tx_ledger(to_player);
CREATE INDEX IF NOT EXISTS idx_tx_ledger_created ON tx_ledger(created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_claims_region ON claims(world, min_x, min_z, max_x, max_z);
CREATE INDEX IF NOT EXISTS idx_claims_owner ON claims(owner_id);
CREATE INDEX IF NOT EXISTS idx_claim_members_member ON claim_members(member_id);
CREATE INDEX IF NOT EXISTS idx_claim_tax_last_paid ON claim_tax(last_paid_at);
"#;
