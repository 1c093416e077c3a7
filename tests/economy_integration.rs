//! Integration tests for the ledger and territory registry
//!
//! Each test runs both services over a SQLite database in a temporary
//! directory, the same way the daemon wires them.

use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use smp_economy::claim::ClaimFailure;
use smp_economy::{
    ClaimPermission, DurableStore, EconomyConfig, EconomyError, EconomyEvent, EconomyServices, PermissionLevel,
    SqliteStore, TransactionKind,
};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const WORLD: &str = "world";

/// Helper to start services over a fresh database
fn start_services() -> (EconomyServices, Arc<SqliteStore>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = EconomyConfig {
        database_path: temp_dir.path().join("economy.db"),
        pool_size: 4,
        ..Default::default()
    };
    let sqlite = Arc::new(SqliteStore::open(&config).unwrap());
    let store: Arc<dyn DurableStore> = sqlite.clone();
    let services = EconomyServices::start(store, &config);
    (services, sqlite, temp_dir)
}

/// A 3x3 chunk claim costs 100 + 9 * 10
#[tokio::test]
async fn test_claim_cost_boundary() {
    let (services, store, _temp) = start_services();
    let owner = Uuid::new_v4();

    services.ledger.set_balance(owner, dec!(189), "setup").await.unwrap();
    let result = services.territory.create_claim(owner, WORLD, 0, 0, 2, 2).await;
    assert!(result.is_failure());
    assert_eq!(result.failure, Some(ClaimFailure::InsufficientFunds));
    assert_eq!(services.ledger.get_balance(owner).await, dec!(189));

    services.ledger.set_balance(owner, dec!(190), "setup").await.unwrap();
    let result = services.territory.create_claim(owner, WORLD, 0, 0, 2, 2).await;
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(services.ledger.get_balance(owner).await, dec!(0));

    let claim = result.claim.unwrap();
    assert_eq!(claim.chunk_count(), 9);
    assert_eq!(claim.center_block(), (24, 24));
    assert_eq!(store.stats().unwrap().claims, 1);

    services.shutdown().await;
}

#[tokio::test]
async fn test_overlapping_claim_rejected_without_charge() {
    let (services, store, _temp) = start_services();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    services.ledger.set_balance(first, dec!(1000), "setup").await.unwrap();
    services.ledger.set_balance(second, dec!(1000), "setup").await.unwrap();

    assert!(services.territory.create_claim(first, WORLD, 0, 0, 2, 2).await.is_success());

    let result = services.territory.create_claim(second, WORLD, 2, 2, 4, 4).await;
    assert_eq!(result.failure, Some(ClaimFailure::Overlap));
    assert_eq!(services.ledger.get_balance(second).await, dec!(1000));
    assert_eq!(store.stats().unwrap().claims, 1);

    // Same rectangle in another world is free
    assert!(services.territory.create_claim(second, "world_nether", 2, 2, 4, 4).await.is_success());

    services.shutdown().await;
}

#[tokio::test]
async fn test_inverted_region_rejected() {
    let (services, _store, _temp) = start_services();
    let owner = Uuid::new_v4();

    let result = services.territory.create_claim(owner, WORLD, 5, 0, 2, 2).await;
    assert_eq!(result.failure, Some(ClaimFailure::InvalidRegion));
    assert_eq!(services.ledger.get_balance(owner).await, dec!(100));

    services.shutdown().await;
}

#[tokio::test]
async fn test_claim_publishes_territory_change() {
    let (services, _store, _temp) = start_services();
    let mut events = services.events.subscribe();
    let owner = Uuid::new_v4();

    services.ledger.set_balance(owner, dec!(500), "setup").await.unwrap();
    let claim = services.territory.create_claim(owner, WORLD, 0, 0, 0, 0).await.claim.unwrap();

    let mut seen = false;
    while let Ok(event) = events.try_recv() {
        if let EconomyEvent::TerritoryChanged { player, claim_name, .. } = event {
            assert_eq!(player, owner);
            assert_eq!(claim_name, Some(claim.display_name()));
            seen = true;
        }
    }
    assert!(seen);

    services.shutdown().await;
}

#[tokio::test]
async fn test_tax_arrears_then_payment() {
    let (services, _store, _temp) = start_services();
    let owner = Uuid::new_v4();

    services.ledger.set_balance(owner, dec!(195), "setup").await.unwrap();
    let claim = services.territory.create_claim(owner, WORLD, 0, 0, 2, 2).await.claim.unwrap();
    assert_eq!(services.ledger.get_balance(owner).await, dec!(5));

    // Nothing is due on the day of creation
    let summary = services.territory.collect_taxes_at(Utc::now()).await;
    assert_eq!(summary.collected + summary.delinquent, 0);

    let first_sweep = Utc::now() + Duration::days(1) + Duration::minutes(1);
    let summary = services.territory.collect_taxes_at(first_sweep).await;
    assert_eq!(summary.delinquent, 1);
    assert_eq!(services.ledger.get_balance(owner).await, dec!(5));

    let tax = services.territory.claim_tax(claim.id).await.unwrap().unwrap();
    assert_eq!(tax.daily_tax, dec!(9));
    assert_eq!(tax.arrears, dec!(9));

    services.ledger.add_balance(owner, dec!(15), "quest").await.unwrap();

    let second_sweep = first_sweep + Duration::days(1);
    let summary = services.territory.collect_taxes_at(second_sweep).await;
    assert_eq!(summary.collected, 1);
    assert_eq!(services.ledger.get_balance(owner).await, dec!(11));

    let tax = services.territory.claim_tax(claim.id).await.unwrap().unwrap();
    assert_eq!(tax.arrears, dec!(0));
    assert_eq!(tax.last_paid_at.timestamp_millis(), second_sweep.timestamp_millis());

    // Paid today, so the same instant finds nothing due
    let summary = services.territory.collect_taxes_at(second_sweep).await;
    assert_eq!(summary.collected + summary.delinquent, 0);

    services.shutdown().await;
}

#[tokio::test]
async fn test_permissions() {
    let (services, _store, _temp) = start_services();
    let owner = Uuid::new_v4();
    let member = Uuid::new_v4();
    let stranger = Uuid::new_v4();

    services.ledger.set_balance(owner, dec!(500), "setup").await.unwrap();
    let claim = services.territory.create_claim(owner, WORLD, 10, 10, 12, 12).await.claim.unwrap();
    services
        .territory
        .add_claim_member(claim.id, member, PermissionLevel::Member)
        .await
        .unwrap();

    let territory = &services.territory;
    assert_eq!(territory.get_player_permission(owner, WORLD, 11, 11).await, ClaimPermission::Owner);
    assert_eq!(territory.get_player_permission(member, WORLD, 11, 11).await, ClaimPermission::Member);
    assert_eq!(territory.get_player_permission(stranger, WORLD, 11, 11).await, ClaimPermission::None);
    assert_eq!(territory.get_player_permission(owner, WORLD, 13, 11).await, ClaimPermission::None);

    // Re-adding overwrites the level
    territory.add_claim_member(claim.id, member, PermissionLevel::Admin).await.unwrap();
    assert_eq!(territory.get_player_permission(member, WORLD, 10, 12).await, ClaimPermission::Admin);

    assert!(territory.remove_claim_member(claim.id, member).await.unwrap());
    assert_eq!(territory.get_player_permission(member, WORLD, 10, 12).await, ClaimPermission::None);

    let missing = territory.add_claim_member(9999, member, PermissionLevel::Guest).await;
    assert!(matches!(missing, Err(EconomyError::ClaimNotFound(9999))));

    services.shutdown().await;
}

#[tokio::test]
async fn test_delete_claim_frees_region() {
    let (services, store, _temp) = start_services();
    let owner = Uuid::new_v4();

    services.ledger.set_balance(owner, dec!(1000), "setup").await.unwrap();
    let claim = services.territory.create_claim(owner, WORLD, 0, 0, 1, 1).await.claim.unwrap();

    services.territory.delete_claim(claim.id).await.unwrap();
    assert!(services.territory.get_claim_at(WORLD, 0, 0).await.is_none());
    assert_eq!(store.stats().unwrap().claims, 0);
    assert!(services.territory.claim_tax(claim.id).await.unwrap().is_none());

    assert!(matches!(
        services.territory.delete_claim(claim.id).await,
        Err(EconomyError::ClaimNotFound(_))
    ));
    assert!(services.territory.create_claim(owner, WORLD, 0, 0, 1, 1).await.is_success());

    services.shutdown().await;
}

#[tokio::test]
async fn test_transfer_conserves_money() {
    let (services, _store, _temp) = start_services();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let ledger = &services.ledger;

    ledger.transfer_money(alice, bob, dec!(30), "trade").await.unwrap();
    assert_eq!(ledger.get_balance(alice).await, dec!(70));
    assert_eq!(ledger.get_balance(bob).await, dec!(130));

    let over = ledger.transfer_money(alice, bob, dec!(70.01), "trade").await;
    assert!(matches!(over, Err(EconomyError::InsufficientFunds { .. })));
    assert!(matches!(
        ledger.transfer_money(alice, alice, dec!(1), "loop").await,
        Err(EconomyError::SelfTransfer)
    ));

    assert_eq!(ledger.get_balance(alice).await + ledger.get_balance(bob).await, dec!(200));

    services.shutdown().await;
}

#[tokio::test]
async fn test_get_balance_creates_account_once() {
    let (services, store, _temp) = start_services();
    let player = Uuid::new_v4();

    assert_eq!(services.ledger.get_balance(player).await, dec!(100));
    assert_eq!(services.ledger.get_balance(player).await, dec!(100));
    assert_eq!(store.stats().unwrap().accounts, 1);

    services.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_credits_not_lost() {
    let (services, _store, _temp) = start_services();
    let player = Uuid::new_v4();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let ledger = services.ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.add_balance(player, dec!(1), "tick").await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(services.ledger.get_balance(player).await, dec!(150));
    services.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_opposite_transfers() {
    let (services, _store, _temp) = start_services();
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let mut handles = Vec::new();
    for i in 0..40 {
        let ledger = services.ledger.clone();
        let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
        handles.push(tokio::spawn(async move {
            let _ = ledger.transfer_money(from, to, dec!(5), "swap").await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let total = services.ledger.get_balance(alice).await + services.ledger.get_balance(bob).await;
    assert_eq!(total, dec!(200));
    services.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_overlapping_claims_single_winner() {
    let (services, store, _temp) = start_services();
    let owners: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

    for owner in &owners {
        services.ledger.set_balance(*owner, dec!(500), "setup").await.unwrap();
    }

    let mut handles = Vec::new();
    for owner in owners.clone() {
        let territory = services.territory.clone();
        handles.push(tokio::spawn(async move {
            territory.create_claim(owner, WORLD, 0, 0, 3, 3).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_success() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(store.stats().unwrap().claims, 1);

    // Only the winner paid
    let mut total = dec!(0);
    for owner in &owners {
        total += services.ledger.get_balance(*owner).await;
    }
    assert_eq!(total, dec!(500) * rust_decimal::Decimal::from(8) - dec!(260));

    services.shutdown().await;
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let config = EconomyConfig {
        database_path: temp_dir.path().join("economy.db"),
        pool_size: 2,
        ..Default::default()
    };
    let owner = Uuid::new_v4();
    let friend = Uuid::new_v4();

    {
        let store: Arc<dyn DurableStore> = Arc::new(SqliteStore::open(&config).unwrap());
        let services = EconomyServices::start(store, &config);
        services.ledger.set_balance(owner, dec!(400), "setup").await.unwrap();
        services.ledger.transfer_money(owner, friend, dec!(25), "gift").await.unwrap();
        assert!(services.territory.create_claim(owner, WORLD, -3, -3, -2, -2).await.is_success());
        services.shutdown().await;
    }

    let sqlite = Arc::new(SqliteStore::open(&config).unwrap());
    let store: Arc<dyn DurableStore> = sqlite.clone();
    let services = EconomyServices::start(store, &config);

    assert_eq!(services.ledger.get_balance(owner).await, dec!(235));
    assert_eq!(services.ledger.get_balance(friend).await, dec!(125));

    let claim = services.territory.get_claim_at(WORLD, -2, -3).await.unwrap();
    assert_eq!(claim.owner, owner);
    assert_eq!(services.territory.claims_owned_by(owner).await.unwrap().len(), 1);

    let history = services.ledger.transaction_history(owner, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].kind, TransactionKind::Spend);
    assert!(history.iter().any(|r| r.kind == TransactionKind::Transfer && r.to == Some(friend)));

    services.shutdown().await;
}
