//! Territory claims, memberships and tax state

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EconomyError;
use crate::PlayerId;

/// Store-generated claim identifier
pub type ClaimId = i64;

/// Width of a chunk in blocks
pub const CHUNK_SIZE: i32 = 16;

/// Longest side a claim may span, in chunks
pub const MAX_CLAIM_SIDE: i64 = 1 << 20;

/// Axis-aligned rectangle of chunks, both corners inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRect {
    pub min_x: i32,
    pub min_z: i32,
    pub max_x: i32,
    pub max_z: i32,
}

impl ChunkRect {
    /// Build a rectangle, rejecting inverted corners and sides longer than
    /// [`MAX_CLAIM_SIDE`]
    pub fn new(min_x: i32, min_z: i32, max_x: i32, max_z: i32) -> Result<Self, EconomyError> {
        let width = max_x as i64 - min_x as i64 + 1;
        let depth = max_z as i64 - min_z as i64 + 1;
        if width < 1 || depth < 1 || width > MAX_CLAIM_SIDE || depth > MAX_CLAIM_SIDE {
            return Err(EconomyError::InvalidRegion {
                min_x,
                min_z,
                max_x,
                max_z,
            });
        }
        Ok(Self {
            min_x,
            min_z,
            max_x,
            max_z,
        })
    }

    pub fn contains(&self, chunk_x: i32, chunk_z: i32) -> bool {
        chunk_x >= self.min_x && chunk_x <= self.max_x && chunk_z >= self.min_z && chunk_z <= self.max_z
    }

    /// Rectangles overlap unless one lies entirely to one side on either axis
    pub fn overlaps(&self, other: &ChunkRect) -> bool {
        !(self.max_x < other.min_x
            || self.min_x > other.max_x
            || self.max_z < other.min_z
            || self.min_z > other.max_z)
    }

    /// Saturates at `i64::MAX` for rectangles built without [`ChunkRect::new`]
    pub fn chunk_count(&self) -> i64 {
        let width = self.max_x as i64 - self.min_x as i64 + 1;
        let depth = self.max_z as i64 - self.min_z as i64 + 1;
        width.saturating_mul(depth)
    }

    /// Block coordinates of the middle of the central chunk
    pub fn center_block(&self) -> (i64, i64) {
        let center_x = (self.min_x as i64 + self.max_x as i64).div_euclid(2);
        let center_z = (self.min_z as i64 + self.max_z as i64).div_euclid(2);
        let size = CHUNK_SIZE as i64;
        (center_x * size + size / 2, center_z * size + size / 2)
    }
}

/// An owned region of one world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub owner: PlayerId,
    pub world: String,
    pub rect: ChunkRect,
    pub created_at: DateTime<Utc>,
}

impl Claim {
    pub fn contains(&self, world: &str, chunk_x: i32, chunk_z: i32) -> bool {
        self.world == world && self.rect.contains(chunk_x, chunk_z)
    }

    pub fn overlaps(&self, world: &str, rect: &ChunkRect) -> bool {
        self.world == world && self.rect.overlaps(rect)
    }

    pub fn chunk_count(&self) -> i64 {
        self.rect.chunk_count()
    }

    pub fn center_block(&self) -> (i64, i64) {
        self.rect.center_block()
    }

    /// Display name used in territory notifications
    pub fn display_name(&self) -> String {
        format!("Claim #{}", self.id)
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Claim{{id={}, owner={}, world='{}', area=({},{}) to ({},{}), chunks={}}}",
            self.id,
            self.owner,
            self.world,
            self.rect.min_x,
            self.rect.min_z,
            self.rect.max_x,
            self.rect.max_z,
            self.chunk_count()
        )
    }
}

/// Level stored on a membership row. The owner never has a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Guest,
    Member,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionLevel::Guest => "guest",
            PermissionLevel::Member => "member",
            PermissionLevel::Admin => "admin",
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guest" => Ok(PermissionLevel::Guest),
            "member" => Ok(PermissionLevel::Member),
            "admin" => Ok(PermissionLevel::Admin),
            other => Err(EconomyError::Parse(format!("unknown permission level: {}", other))),
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effective permission of a player at a location
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClaimPermission {
    None,
    Guest,
    Member,
    Admin,
    Owner,
}

impl From<PermissionLevel> for ClaimPermission {
    fn from(level: PermissionLevel) -> Self {
        match level {
            PermissionLevel::Guest => ClaimPermission::Guest,
            PermissionLevel::Member => ClaimPermission::Member,
            PermissionLevel::Admin => ClaimPermission::Admin,
        }
    }
}

/// Things a player may try to do inside a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimAction {
    Build,
    Destroy,
    UseItems,
    Interact,
    ManageMembers,
    DeleteClaim,
}

impl ClaimPermission {
    /// Action table: owners and admins may do anything, members may build,
    /// guests may only use and interact.
    pub fn allows(&self, action: ClaimAction) -> bool {
        match self {
            ClaimPermission::Owner | ClaimPermission::Admin => true,
            ClaimPermission::Member => matches!(
                action,
                ClaimAction::Build | ClaimAction::Destroy | ClaimAction::UseItems | ClaimAction::Interact
            ),
            ClaimPermission::Guest => matches!(action, ClaimAction::UseItems | ClaimAction::Interact),
            ClaimPermission::None => false,
        }
    }
}

/// Membership row, unique per (claim, member)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimMember {
    pub claim_id: ClaimId,
    pub member: PlayerId,
    pub level: PermissionLevel,
    pub added_at: DateTime<Utc>,
}

impl ClaimMember {
    pub fn can_perform(&self, action: ClaimAction) -> bool {
        ClaimPermission::from(self.level).allows(action)
    }
}

/// Tax bookkeeping for one claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimTaxState {
    pub claim_id: ClaimId,
    pub daily_tax: Decimal,
    pub last_paid_at: DateTime<Utc>,
    pub arrears: Decimal,
}

/// Claim tax row that is due for collection
#[derive(Debug, Clone, PartialEq)]
pub struct DueTax {
    pub claim_id: ClaimId,
    pub daily_tax: Decimal,
    pub owner: PlayerId,
    pub arrears: Decimal,
}

/// Why a claim could not be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimFailure {
    InvalidRegion,
    Overlap,
    InsufficientFunds,
    Store,
}

/// Outcome of a claim creation
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResult {
    pub success: bool,
    pub message: String,
    pub claim: Option<Claim>,
    pub failure: Option<ClaimFailure>,
}

impl ClaimResult {
    pub fn success(claim: Claim, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            claim: Some(claim),
            failure: None,
        }
    }

    pub fn failure(reason: ClaimFailure, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            claim: None,
            failure: Some(reason),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_failure(&self) -> bool {
        !self.success
    }
}
