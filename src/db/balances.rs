//! Balance rows and the transaction ledger

use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::Text;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::models::{format_ts, parse_decimal, NewTransaction, TransactionRow};
use super::schema::{balances, tx_ledger};
use crate::error::EconomyError;
use crate::transaction::TransactionRecord;
use crate::PlayerId;

/// Stored balance, `None` if the account was never created
pub fn load_balance(conn: &mut SqliteConnection, player: PlayerId) -> Result<Option<Decimal>, EconomyError> {
    let stored = balances::table
        .find(player.to_string())
        .select(balances::balance)
        .first::<String>(conn)
        .optional()?;

    stored.as_deref().map(parse_decimal).transpose()
}

/// Create the account with the starting balance unless a row already exists,
/// then return whatever balance is stored.
pub fn create_account(
    conn: &mut SqliteConnection,
    player: PlayerId,
    starting_balance: Decimal,
) -> Result<Decimal, EconomyError> {
    let player_id = player.to_string();
    let now = format_ts(&Utc::now());

    let inserted = diesel::sql_query(
        r#"
        INSERT INTO balances (player_id, balance, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(player_id) DO NOTHING
        "#,
    )
    .bind::<Text, _>(&player_id)
    .bind::<Text, _>(starting_balance.to_string())
    .bind::<Text, _>(&now)
    .execute(conn)?;

    if inserted > 0 {
        info!(player = %player, balance = %starting_balance, "Created new account");
    }

    let stored = balances::table
        .find(&player_id)
        .select(balances::balance)
        .first::<String>(conn)?;
    parse_decimal(&stored)
}

/// Replace the stored balances for a batch of accounts in one transaction
pub fn upsert_balances(
    conn: &mut SqliteConnection,
    batch: &[(PlayerId, Decimal)],
) -> Result<usize, EconomyError> {
    let now = format_ts(&Utc::now());

    conn.transaction::<_, EconomyError, _>(|conn| {
        for (player, balance) in batch {
            diesel::sql_query(
                r#"
                INSERT INTO balances (player_id, balance, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(player_id) DO UPDATE SET
                    balance = excluded.balance,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind::<Text, _>(player.to_string())
            .bind::<Text, _>(balance.to_string())
            .bind::<Text, _>(&now)
            .execute(conn)?;
        }
        Ok(())
    })?;

    debug!(accounts = batch.len(), "Upserted balances");
    Ok(batch.len())
}

pub fn append_transaction(conn: &mut SqliteConnection, record: &TransactionRecord) -> Result<(), EconomyError> {
    diesel::insert_into(tx_ledger::table)
        .values(NewTransaction::from(record))
        .execute(conn)?;
    Ok(())
}

/// Most recent ledger entries touching an account, newest first
pub fn load_transactions(
    conn: &mut SqliteConnection,
    player: PlayerId,
    limit: i64,
) -> Result<Vec<TransactionRecord>, EconomyError> {
    let player_id = player.to_string();

    let rows = tx_ledger::table
        .filter(
            tx_ledger::from_player
                .eq(&player_id)
                .or(tx_ledger::to_player.eq(&player_id)),
        )
        .order(tx_ledger::id.desc())
        .limit(limit)
        .select(TransactionRow::as_select())
        .load(conn)?;

    rows.into_iter().map(TransactionRecord::try_from).collect()
}

pub fn count_accounts(conn: &mut SqliteConnection) -> Result<i64, EconomyError> {
    Ok(balances::table.count().get_result(conn)?)
}

pub fn count_transactions(conn: &mut SqliteConnection) -> Result<i64, EconomyError> {
    Ok(tx_ledger::table.count().get_result(conn)?)
}
