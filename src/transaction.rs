//! Transaction records appended to the ledger history

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EconomyError;
use crate::PlayerId;

/// Kind of money movement recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Transfer,
    Earn,
    Spend,
    Tax,
    QuestReward,
    AdminSet,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Transfer => "transfer",
            TransactionKind::Earn => "earn",
            TransactionKind::Spend => "spend",
            TransactionKind::Tax => "tax",
            TransactionKind::QuestReward => "quest_reward",
            TransactionKind::AdminSet => "admin_set",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer" => Ok(TransactionKind::Transfer),
            "earn" => Ok(TransactionKind::Earn),
            "spend" => Ok(TransactionKind::Spend),
            "tax" => Ok(TransactionKind::Tax),
            "quest_reward" => Ok(TransactionKind::QuestReward),
            "admin_set" => Ok(TransactionKind::AdminSet),
            other => Err(EconomyError::Parse(format!("unknown transaction kind: {}", other))),
        }
    }
}

/// Immutable ledger entry. Written once, after the cached balance changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub from: Option<PlayerId>,
    pub to: Option<PlayerId>,
    /// Signed; `admin_set` records carry the delta against the prior balance
    pub amount: Decimal,
    pub kind: TransactionKind,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    pub fn new(
        from: Option<PlayerId>,
        to: Option<PlayerId>,
        amount: Decimal,
        kind: TransactionKind,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            kind,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}
