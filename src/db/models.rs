//! Diesel row types and their conversion into domain values

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

use super::schema::{claim_members, claim_tax, claims, tx_ledger};
use crate::claim::{Claim, ChunkRect, ClaimMember, ClaimTaxState};
use crate::error::EconomyError;
use crate::transaction::TransactionRecord;

/// Fixed-width UTC timestamp so that text order matches time order
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>, EconomyError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EconomyError::Parse(format!("bad timestamp '{}': {}", s, e)))
}

pub fn parse_decimal(s: &str) -> Result<Decimal, EconomyError> {
    s.parse::<Decimal>()
        .map_err(|e| EconomyError::Parse(format!("bad decimal '{}': {}", s, e)))
}

pub fn parse_player(s: &str) -> Result<Uuid, EconomyError> {
    Uuid::parse_str(s).map_err(|e| EconomyError::Parse(format!("bad player id '{}': {}", s, e)))
}

// ============================================================================
// Transaction ledger
// ============================================================================

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = tx_ledger)]
pub struct TransactionRow {
    pub id: i64,
    pub from_player: Option<String>,
    pub to_player: Option<String>,
    pub amount: String,
    pub kind: String,
    pub reason: String,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = tx_ledger)]
pub struct NewTransaction<'a> {
    pub from_player: Option<String>,
    pub to_player: Option<String>,
    pub amount: String,
    pub kind: &'a str,
    pub reason: &'a str,
    pub created_at: String,
}

impl<'a> From<&'a TransactionRecord> for NewTransaction<'a> {
    fn from(record: &'a TransactionRecord) -> Self {
        Self {
            from_player: record.from.map(|p| p.to_string()),
            to_player: record.to.map(|p| p.to_string()),
            amount: record.amount.to_string(),
            kind: record.kind.as_str(),
            reason: &record.reason,
            created_at: format_ts(&record.created_at),
        }
    }
}

impl TryFrom<TransactionRow> for TransactionRecord {
    type Error = EconomyError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            from: row.from_player.as_deref().map(parse_player).transpose()?,
            to: row.to_player.as_deref().map(parse_player).transpose()?,
            amount: parse_decimal(&row.amount)?,
            kind: row.kind.parse()?,
            reason: row.reason,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

// ============================================================================
// Claims
// ============================================================================

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = claims)]
pub struct ClaimRow {
    pub id: i64,
    pub owner_id: String,
    pub world: String,
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
    pub created_at: String,
}

#[derive(Insertable)]
#[diesel(table_name = claims)]
pub struct NewClaim<'a> {
    pub owner_id: String,
    pub world: &'a str,
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
    pub created_at: String,
}

impl TryFrom<ClaimRow> for Claim {
    type Error = EconomyError;

    fn try_from(row: ClaimRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            owner: parse_player(&row.owner_id)?,
            world: row.world,
            rect: ChunkRect::new(row.min_x, row.min_z, row.max_x, row.max_z)?,
            created_at: parse_ts(&row.created_at)?,
        })
    }
}

// ============================================================================
// Memberships and tax
// ============================================================================

#[derive(Queryable, Selectable, Debug)]
#[diesel(table_name = claim_members)]
pub struct ClaimMemberRow {
    pub claim_id: i64,
    pub member_id: String,
    pub permission_level: String,
    pub added_at: String,
}

impl TryFrom<ClaimMemberRow> for ClaimMember {
    type Error = EconomyError;

    fn try_from(row: ClaimMemberRow) -> Result<Self, Self::Error> {
        Ok(Self {
            claim_id: row.claim_id,
            member: parse_player(&row.member_id)?,
            level: row.permission_level.parse()?,
            added_at: parse_ts(&row.added_at)?,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = claim_tax)]
pub struct ClaimTaxRow {
    pub claim_id: i64,
    pub daily_tax: String,
    pub last_paid_at: String,
    pub arrears: String,
}

impl TryFrom<ClaimTaxRow> for ClaimTaxState {
    type Error = EconomyError;

    fn try_from(row: ClaimTaxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            claim_id: row.claim_id,
            daily_tax: parse_decimal(&row.daily_tax)?,
            last_paid_at: parse_ts(&row.last_paid_at)?,
            arrears: parse_decimal(&row.arrears)?,
        })
    }
}
