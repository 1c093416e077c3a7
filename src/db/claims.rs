//! Claim, membership and claim tax rows

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use rust_decimal::Decimal;
use tracing::debug;

use super::models::{
    format_ts, parse_decimal, parse_player, ClaimMemberRow, ClaimRow, ClaimTaxRow, NewClaim,
};
use super::schema::{claim_members, claim_tax, claims};
use crate::claim::{Claim, ChunkRect, ClaimId, ClaimMember, ClaimTaxState, DueTax, PermissionLevel};
use crate::error::EconomyError;
use crate::PlayerId;

diesel::define_sql_function! {
    fn last_insert_rowid() -> BigInt;
}

/// First claim in `world` whose rectangle contains the chunk
pub fn load_claim_containing(
    conn: &mut SqliteConnection,
    world: &str,
    chunk_x: i32,
    chunk_z: i32,
) -> Result<Option<Claim>, EconomyError> {
    let row = claims::table
        .filter(claims::world.eq(world))
        .filter(claims::min_x.le(chunk_x))
        .filter(claims::max_x.ge(chunk_x))
        .filter(claims::min_z.le(chunk_z))
        .filter(claims::max_z.ge(chunk_z))
        .select(ClaimRow::as_select())
        .first(conn)
        .optional()?;

    row.map(Claim::try_from).transpose()
}

pub fn load_claim(conn: &mut SqliteConnection, claim_id: ClaimId) -> Result<Option<Claim>, EconomyError> {
    let row = claims::table
        .find(claim_id)
        .select(ClaimRow::as_select())
        .first(conn)
        .optional()?;

    row.map(Claim::try_from).transpose()
}

pub fn load_claims_owned_by(conn: &mut SqliteConnection, owner: PlayerId) -> Result<Vec<Claim>, EconomyError> {
    let rows = claims::table
        .filter(claims::owner_id.eq(owner.to_string()))
        .order(claims::id.asc())
        .select(ClaimRow::as_select())
        .load(conn)?;

    rows.into_iter().map(Claim::try_from).collect()
}

/// Subset of `ids` that still exist
pub fn existing_claim_ids(conn: &mut SqliteConnection, ids: &[ClaimId]) -> Result<Vec<ClaimId>, EconomyError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    Ok(claims::table
        .filter(claims::id.eq_any(ids))
        .select(claims::id)
        .load(conn)?)
}

/// Number of claims in `world` overlapping `rect`
pub fn overlap_count(conn: &mut SqliteConnection, world: &str, rect: &ChunkRect) -> Result<i64, EconomyError> {
    Ok(claims::table
        .filter(claims::world.eq(world))
        .filter(claims::max_x.ge(rect.min_x))
        .filter(claims::min_x.le(rect.max_x))
        .filter(claims::max_z.ge(rect.min_z))
        .filter(claims::min_z.le(rect.max_z))
        .count()
        .get_result(conn)?)
}

/// Insert a claim. The overlap check runs in the same write transaction, so
/// two writers cannot both pass it.
pub fn insert_claim(
    conn: &mut SqliteConnection,
    owner: PlayerId,
    world: &str,
    rect: &ChunkRect,
    created_at: &DateTime<Utc>,
) -> Result<ClaimId, EconomyError> {
    conn.immediate_transaction::<_, EconomyError, _>(|conn| {
        if overlap_count(conn, world, rect)? > 0 {
            return Err(EconomyError::ClaimOverlap(world.to_string()));
        }

        diesel::insert_into(claims::table)
            .values(NewClaim {
                owner_id: owner.to_string(),
                world,
                min_x: rect.min_x,
                min_z: rect.min_z,
                max_x: rect.max_x,
                max_z: rect.max_z,
                created_at: format_ts(created_at),
            })
            .execute(conn)?;

        let id = diesel::select(last_insert_rowid()).get_result::<i64>(conn)?;
        debug!(claim_id = id, world = %world, "Inserted claim row");
        Ok(id)
    })
}

/// Delete a claim together with its members and tax row
pub fn delete_claim(conn: &mut SqliteConnection, claim_id: ClaimId) -> Result<bool, EconomyError> {
    conn.transaction::<_, EconomyError, _>(|conn| {
        diesel::delete(claim_members::table.filter(claim_members::claim_id.eq(claim_id))).execute(conn)?;
        diesel::delete(claim_tax::table.filter(claim_tax::claim_id.eq(claim_id))).execute(conn)?;
        let deleted = diesel::delete(claims::table.find(claim_id)).execute(conn)?;
        Ok(deleted > 0)
    })
}

/// Insert or overwrite the membership level for (claim, member)
pub fn upsert_claim_member(
    conn: &mut SqliteConnection,
    claim_id: ClaimId,
    member: PlayerId,
    level: PermissionLevel,
    added_at: &DateTime<Utc>,
) -> Result<bool, EconomyError> {
    let exists: i64 = claims::table.find(claim_id).count().get_result(conn)?;
    if exists == 0 {
        return Err(EconomyError::ClaimNotFound(claim_id));
    }

    let affected = diesel::sql_query(
        r#"
        INSERT INTO claim_members (claim_id, member_id, permission_level, added_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(claim_id, member_id) DO UPDATE SET
            permission_level = excluded.permission_level
        "#,
    )
    .bind::<BigInt, _>(claim_id)
    .bind::<Text, _>(member.to_string())
    .bind::<Text, _>(level.as_str())
    .bind::<Text, _>(format_ts(added_at))
    .execute(conn)?;

    Ok(affected > 0)
}

pub fn load_claim_member(
    conn: &mut SqliteConnection,
    claim_id: ClaimId,
    member: PlayerId,
) -> Result<Option<ClaimMember>, EconomyError> {
    let row = claim_members::table
        .find((claim_id, member.to_string()))
        .select(ClaimMemberRow::as_select())
        .first(conn)
        .optional()?;

    row.map(ClaimMember::try_from).transpose()
}

pub fn remove_claim_member(
    conn: &mut SqliteConnection,
    claim_id: ClaimId,
    member: PlayerId,
) -> Result<bool, EconomyError> {
    let deleted = diesel::delete(claim_members::table.find((claim_id, member.to_string()))).execute(conn)?;
    Ok(deleted > 0)
}

pub fn count_claims(conn: &mut SqliteConnection) -> Result<i64, EconomyError> {
    Ok(claims::table.count().get_result(conn)?)
}

pub fn count_members(conn: &mut SqliteConnection) -> Result<i64, EconomyError> {
    Ok(claim_members::table.count().get_result(conn)?)
}

// ============================================================================
// Claim tax
// ============================================================================

pub fn insert_claim_tax(
    conn: &mut SqliteConnection,
    claim_id: ClaimId,
    daily_tax: Decimal,
    created_at: &DateTime<Utc>,
) -> Result<(), EconomyError> {
    diesel::insert_into(claim_tax::table)
        .values(ClaimTaxRow {
            claim_id,
            daily_tax: daily_tax.to_string(),
            last_paid_at: format_ts(created_at),
            arrears: Decimal::ZERO.to_string(),
        })
        .execute(conn)?;
    Ok(())
}

pub fn load_claim_tax(conn: &mut SqliteConnection, claim_id: ClaimId) -> Result<Option<ClaimTaxState>, EconomyError> {
    let row = claim_tax::table
        .find(claim_id)
        .select(ClaimTaxRow::as_select())
        .first(conn)
        .optional()?;

    row.map(ClaimTaxState::try_from).transpose()
}

/// Tax rows last paid at least one day before `as_of`, with their owners
pub fn due_tax_rows(conn: &mut SqliteConnection, as_of: &DateTime<Utc>) -> Result<Vec<DueTax>, EconomyError> {
    let cutoff = format_ts(&(*as_of - Duration::days(1)));

    let rows = claim_tax::table
        .inner_join(claims::table)
        .filter(claim_tax::last_paid_at.le(cutoff))
        .order(claim_tax::claim_id.asc())
        .select((claim_tax::claim_id, claim_tax::daily_tax, claims::owner_id, claim_tax::arrears))
        .load::<(i64, String, String, String)>(conn)?;

    rows.into_iter()
        .map(|(claim_id, daily_tax, owner_id, arrears)| {
            Ok(DueTax {
                claim_id,
                daily_tax: parse_decimal(&daily_tax)?,
                owner: parse_player(&owner_id)?,
                arrears: parse_decimal(&arrears)?,
            })
        })
        .collect()
}

pub fn mark_tax_paid(conn: &mut SqliteConnection, claim_id: ClaimId, paid_at: &DateTime<Utc>) -> Result<(), EconomyError> {
    diesel::update(claim_tax::table.find(claim_id))
        .set((
            claim_tax::last_paid_at.eq(format_ts(paid_at)),
            claim_tax::arrears.eq(Decimal::ZERO.to_string()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn set_tax_arrears(conn: &mut SqliteConnection, claim_id: ClaimId, arrears: Decimal) -> Result<(), EconomyError> {
    diesel::update(claim_tax::table.find(claim_id))
        .set(claim_tax::arrears.eq(arrears.to_string()))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn conn() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        conn
    }

    fn rect(min_x: i32, min_z: i32, max_x: i32, max_z: i32) -> ChunkRect {
        ChunkRect::new(min_x, min_z, max_x, max_z).unwrap()
    }

    #[test]
    fn test_insert_and_lookup_claim() {
        let mut conn = conn();
        let owner = Uuid::new_v4();
        let now = Utc::now();

        let id = insert_claim(&mut conn, owner, "overworld", &rect(0, 0, 2, 2), &now).unwrap();

        let claim = load_claim_containing(&mut conn, "overworld", 2, 1).unwrap().unwrap();
        assert_eq!(claim.id, id);
        assert_eq!(claim.owner, owner);
        assert!(load_claim_containing(&mut conn, "overworld", 3, 1).unwrap().is_none());
        assert!(load_claim_containing(&mut conn, "nether", 1, 1).unwrap().is_none());
    }

    #[test]
    fn test_insert_rejects_overlap_in_same_world() {
        let mut conn = conn();
        let now = Utc::now();

        insert_claim(&mut conn, Uuid::new_v4(), "overworld", &rect(0, 0, 2, 2), &now).unwrap();

        let err = insert_claim(&mut conn, Uuid::new_v4(), "overworld", &rect(2, 2, 5, 5), &now).unwrap_err();
        assert!(matches!(err, EconomyError::ClaimOverlap(_)));

        insert_claim(&mut conn, Uuid::new_v4(), "nether", &rect(0, 0, 2, 2), &now).unwrap();
        assert_eq!(count_claims(&mut conn).unwrap(), 2);
        assert_eq!(overlap_count(&mut conn, "overworld", &rect(-1, -1, 0, 0)).unwrap(), 1);
        assert_eq!(overlap_count(&mut conn, "overworld", &rect(3, 0, 4, 4)).unwrap(), 0);
    }

    #[test]
    fn test_member_upsert_overwrites_level() {
        let mut conn = conn();
        let now = Utc::now();
        let member = Uuid::new_v4();
        let id = insert_claim(&mut conn, Uuid::new_v4(), "overworld", &rect(0, 0, 0, 0), &now).unwrap();

        upsert_claim_member(&mut conn, id, member, PermissionLevel::Guest, &now).unwrap();
        upsert_claim_member(&mut conn, id, member, PermissionLevel::Admin, &now).unwrap();

        let row = load_claim_member(&mut conn, id, member).unwrap().unwrap();
        assert_eq!(row.level, PermissionLevel::Admin);
        assert_eq!(count_members(&mut conn).unwrap(), 1);

        assert!(matches!(
            upsert_claim_member(&mut conn, id + 100, member, PermissionLevel::Guest, &now),
            Err(EconomyError::ClaimNotFound(_))
        ));
    }

    #[test]
    fn test_delete_claim_cascades() {
        let mut conn = conn();
        let now = Utc::now();
        let id = insert_claim(&mut conn, Uuid::new_v4(), "overworld", &rect(0, 0, 1, 1), &now).unwrap();
        upsert_claim_member(&mut conn, id, Uuid::new_v4(), PermissionLevel::Member, &now).unwrap();
        insert_claim_tax(&mut conn, id, dec!(4), &now).unwrap();

        assert!(delete_claim(&mut conn, id).unwrap());
        assert!(!delete_claim(&mut conn, id).unwrap());
        assert_eq!(count_members(&mut conn).unwrap(), 0);
        assert!(load_claim_tax(&mut conn, id).unwrap().is_none());
        assert!(existing_claim_ids(&mut conn, &[id]).unwrap().is_empty());
    }

    #[test]
    fn test_due_tax_rows_respects_one_day() {
        let mut conn = conn();
        let owner = Uuid::new_v4();
        let created = Utc::now();
        let id = insert_claim(&mut conn, owner, "overworld", &rect(0, 0, 2, 2), &created).unwrap();
        insert_claim_tax(&mut conn, id, dec!(9), &created).unwrap();

        assert!(due_tax_rows(&mut conn, &(created + Duration::hours(23))).unwrap().is_empty());

        let due = due_tax_rows(&mut conn, &(created + Duration::days(1))).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].owner, owner);
        assert_eq!(due[0].daily_tax, dec!(9));
        assert_eq!(due[0].arrears, Decimal::ZERO);

        set_tax_arrears(&mut conn, id, dec!(9)).unwrap();
        assert_eq!(load_claim_tax(&mut conn, id).unwrap().unwrap().arrears, dec!(9));

        let paid_at = created + Duration::days(1);
        mark_tax_paid(&mut conn, id, &paid_at).unwrap();
        let state = load_claim_tax(&mut conn, id).unwrap().unwrap();
        assert_eq!(state.arrears, Decimal::ZERO);
        assert_eq!(state.last_paid_at, parse_ts_for_test(&paid_at));
    }

    fn parse_ts_for_test(ts: &DateTime<Utc>) -> DateTime<Utc> {
        crate::db::models::parse_ts(&format_ts(ts)).unwrap()
    }
}
