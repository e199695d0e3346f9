//! Integration tests for SQLite snapshots

use chrono::{Duration, TimeZone, Utc};
use quota_rs::admission::AdmissionRequest;
use quota_rs::allocation::Role;
use quota_rs::clock::{Clock, ManualClock};
use quota_rs::config::Config;
use quota_rs::ledger::AllocationKey;
use quota_rs::persistence::SqliteLedgerStore;
use quota_rs::QuotaEngine;
use std::sync::Arc;

fn engine_with_clock() -> (Arc<ManualClock>, QuotaEngine) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
    ));
    let engine = QuotaEngine::new(&Config::default(), clock.clone());
    (clock, engine)
}

#[tokio::test]
async fn test_snapshot_round_trip_in_memory() {
    let store = SqliteLedgerStore::new("sqlite::memory:").await.unwrap();
    let (_clock, engine) = engine_with_clock();
    engine.register_tenant("acme", 100_000, 5).await.unwrap();
    engine.register_unlimited_tenant("bigco", 1).await.unwrap();

    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 800);
    let done = engine.check_and_reserve(&request).await.unwrap();
    engine.reconcile(done.reservation_id, 750).await.unwrap();
    engine.check_and_reserve(&request).await.unwrap();

    let snapshot = engine.snapshot().await;
    store.save_snapshot(&snapshot).await.unwrap();

    let mut loaded = store.load_snapshot().await.unwrap();
    loaded.ledger.pools.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
    assert_eq!(loaded.ledger.pools.len(), 2);
    assert_eq!(loaded.ledger.pools[0].tenant_id, "acme");
    assert_eq!(loaded.ledger.pools[0].tokens_used_this_period, 1550);
    assert_eq!(loaded.ledger.pools[0].period_anchor_day, 5);
    assert!(loaded.ledger.pools[1].unlimited);
    assert_eq!(loaded.ledger.allocations.len(), 1);
    assert_eq!(loaded.reservations.len(), 1);
    assert_eq!(loaded.reservations[0].amount_reserved, 800);
}

#[tokio::test]
async fn test_saving_twice_replaces_previous_snapshot() {
    let store = SqliteLedgerStore::new("sqlite::memory:").await.unwrap();
    let (_clock, engine) = engine_with_clock();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let request = AdmissionRequest::new("acme", "alice", Role::Owner, 100);
    let reservation = engine.check_and_reserve(&request).await.unwrap();
    store.save_snapshot(&engine.snapshot().await).await.unwrap();

    engine.reconcile(reservation.reservation_id, 100).await.unwrap();
    store.save_snapshot(&engine.snapshot().await).await.unwrap();

    let loaded = store.load_snapshot().await.unwrap();
    assert_eq!(loaded.ledger.pools.len(), 1);
    assert!(loaded.reservations.is_empty());
}

#[tokio::test]
async fn test_restart_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("quota.db").display());

    let (clock, engine) = engine_with_clock();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();
    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 600);
    let reservation = engine.check_and_reserve(&request).await.unwrap();

    {
        let store = SqliteLedgerStore::new(&url).await.unwrap();
        store.save_snapshot(&engine.snapshot().await).await.unwrap();
    }

    // Fresh process on the same clock
    let restarted = QuotaEngine::new(&Config::default(), clock.clone());
    let store = SqliteLedgerStore::new(&url).await.unwrap();
    restarted.restore(store.load_snapshot().await.unwrap()).await;

    let pool = restarted.ledger().get_pool("acme").await.unwrap();
    assert_eq!(pool.tokens_used_this_period, 600);

    // The open reservation survived and reconciles against restored rows
    let outcome = restarted
        .reconcile(reservation.reservation_id, 400)
        .await
        .unwrap();
    assert_eq!(outcome.delta, -200);

    let key = AllocationKey::new("acme", "alice", clock.today());
    let row = restarted.ledger().find_allocation(&key).await.unwrap();
    assert_eq!(row.tokens_used_today, 400);
    assert_eq!(
        restarted.ledger().get_pool("acme").await.unwrap().tokens_used_this_period,
        400
    );
}

#[tokio::test]
async fn test_reservations_expiring_before() {
    let store = SqliteLedgerStore::new("sqlite::memory:").await.unwrap();
    let (clock, engine) = engine_with_clock();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let request = AdmissionRequest::new("acme", "alice", Role::Owner, 10);
    let early = engine.check_and_reserve(&request).await.unwrap();
    clock.advance(Duration::minutes(10));
    engine.check_and_reserve(&request).await.unwrap();
    store.save_snapshot(&engine.snapshot().await).await.unwrap();

    let due = store
        .reservations_expiring_before(early.expires_at + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].reservation_id, early.reservation_id);
}
