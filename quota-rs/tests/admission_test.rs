//! Integration tests for admission, reconciliation and expiry

use chrono::{Duration, TimeZone, Utc};
use quota_rs::admission::{AdmissionRequest, DenialReason, TokenUsage};
use quota_rs::allocation::Role;
use quota_rs::clock::ManualClock;
use quota_rs::config::Config;
use quota_rs::ledger::{AllocationKey, CounterTarget};
use quota_rs::{QuotaEngine, QuotaError};
use std::sync::Arc;
use uuid::Uuid;

fn setup() -> (Arc<ManualClock>, Arc<QuotaEngine>) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
    ));
    let engine = QuotaEngine::new(&Config::default(), clock.clone());
    (clock, Arc::new(engine))
}

async fn tenant_used(engine: &QuotaEngine, tenant_id: &str) -> u64 {
    engine
        .ledger()
        .get_pool(tenant_id)
        .await
        .unwrap()
        .tokens_used_this_period
}

async fn member_used_today(engine: &QuotaEngine, tenant_id: &str, member_id: &str) -> u64 {
    let key = AllocationKey::new(tenant_id, member_id, engine.clock().today());
    engine
        .ledger()
        .find_allocation(&key)
        .await
        .map(|row| row.tokens_used_today)
        .unwrap_or(0)
}

#[tokio::test]
async fn test_tenant_budget_exhausted_reports_remaining() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 1000, 1).await.unwrap();
    engine
        .ledger()
        .atomic_adjust(&CounterTarget::TenantPeriod("acme".into()), 950, None)
        .await
        .unwrap();

    let request = AdmissionRequest::new("acme", "owner-1", Role::Owner, 100);
    let denied = engine.check_and_reserve(&request).await.unwrap_err();

    assert_eq!(denied.reason, DenialReason::TenantBudgetExhausted);
    assert_eq!(denied.snapshot.tenant_remaining, Some(50));
    assert_eq!(tenant_used(&engine, "acme").await, 950);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_against_member_limit() {
    let (_clock, engine) = setup();
    // 3000 / 30 days = 100 tokens per day for a single member
    engine.register_tenant("acme", 3000, 1).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let request = AdmissionRequest::new("acme", "alice", Role::Member, 60);
            engine.check_and_reserve(&request).await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(denied) => assert!(matches!(
                denied.reason,
                DenialReason::MemberDailyLimitExhausted | DenialReason::ConcurrentReservationLost
            )),
        }
    }

    assert_eq!(admitted, 1);
    assert_eq!(member_used_today(&engine, "acme", "alice").await, 60);
    assert_eq!(tenant_used(&engine, "acme").await, 60);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_overdraw_pool() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 1000, 1).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..50 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let member = format!("admin-{}", i);
            let request = AdmissionRequest::new("acme", &member, Role::Admin, 30);
            engine.reserve_with_retry(&request).await.is_ok()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 33);
    assert_eq!(tenant_used(&engine, "acme").await, 990);
}

#[tokio::test]
async fn test_reconcile_applies_only_the_delta() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 50);
    let reservation = engine.check_and_reserve(&request).await.unwrap();
    assert_eq!(tenant_used(&engine, "acme").await, 50);

    let outcome = engine.reconcile(reservation.reservation_id, 70).await.unwrap();
    assert_eq!(outcome.delta, 20);
    assert_eq!(tenant_used(&engine, "acme").await, 70);
    assert_eq!(member_used_today(&engine, "acme", "alice").await, 70);
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 500);
    let reservation = engine.check_and_reserve(&request).await.unwrap();

    let first = engine.reconcile(reservation.reservation_id, 320).await.unwrap();
    let second = engine.reconcile(reservation.reservation_id, 320).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.delta, -180);
    assert_eq!(tenant_used(&engine, "acme").await, 320);
    assert_eq!(member_used_today(&engine, "acme", "alice").await, 320);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconciles_apply_once() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();
    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 500);
    let reservation = engine.check_and_reserve(&request).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let id = reservation.reservation_id;
            tokio::spawn(async move { engine.reconcile(id, 300).await.unwrap() })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }
    assert!(outcomes.iter().all(|o| *o == outcomes[0]));
    assert_eq!(outcomes[0].delta, -200);

    assert_eq!(tenant_used(&engine, "acme").await, 300);
    assert_eq!(member_used_today(&engine, "acme", "alice").await, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconcile_racing_expiry_settles_once() {
    for _ in 0..20 {
        let (clock, engine) = setup();
        engine.register_tenant("acme", 100_000, 1).await.unwrap();
        let request = AdmissionRequest::new("acme", "alice", Role::Technician, 500);
        let reservation = engine.check_and_reserve(&request).await.unwrap();
        clock.advance(Duration::minutes(6));

        let reconcile = {
            let engine = engine.clone();
            let id = reservation.reservation_id;
            tokio::spawn(async move { engine.reconcile(id, 300).await })
        };
        let expire = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.expire_stale().await })
        };
        let reconciled = reconcile.await.unwrap();
        let swept = expire.await.unwrap();

        // Exactly one side closes the reservation
        let expected = match reconciled {
            Ok(outcome) => {
                assert_eq!(outcome.actual_amount, 300);
                assert!(swept.expired.is_empty());
                300
            }
            Err(QuotaError::ReservationNotFound(_)) => {
                assert_eq!(swept.expired.len(), 1);
                0
            }
            Err(e) => panic!("unexpected error: {}", e),
        };
        assert_eq!(tenant_used(&engine, "acme").await, expected);
        assert_eq!(member_used_today(&engine, "acme", "alice").await, expected);
    }
}

#[tokio::test]
async fn test_reconcile_with_token_split() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();
    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 400);
    let reservation = engine.check_and_reserve(&request).await.unwrap();

    let outcome = engine
        .reconcile_usage(reservation.reservation_id, TokenUsage::new(250, 100))
        .await
        .unwrap();
    assert_eq!(outcome.actual_amount, 350);
    assert_eq!(outcome.delta, -50);
    assert_eq!(outcome.usage.map(|u| u.output_tokens), Some(100));
    assert_eq!(tenant_used(&engine, "acme").await, 350);
}

#[tokio::test]
async fn test_reconcile_unknown_reservation() {
    let (_clock, engine) = setup();
    let err = engine.reconcile(Uuid::new_v4(), 10).await.unwrap_err();
    assert!(matches!(err, QuotaError::ReservationNotFound(_)));
}

#[tokio::test]
async fn test_expired_reservation_is_refunded() {
    let (clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let request = AdmissionRequest::new("acme", "alice", Role::Technician, 400);
    let reservation = engine.check_and_reserve(&request).await.unwrap();
    assert_eq!(tenant_used(&engine, "acme").await, 400);

    // Not yet due
    assert!(engine.expire_stale().await.expired.is_empty());

    clock.advance(Duration::minutes(6));
    let sweep = engine.expire_stale().await;
    assert_eq!(sweep.expired.len(), 1);
    assert_eq!(sweep.expired[0].reservation_id, reservation.reservation_id);

    assert_eq!(tenant_used(&engine, "acme").await, 0);
    assert_eq!(member_used_today(&engine, "acme", "alice").await, 0);

    // A late reconcile does not resurrect the reservation
    let err = engine
        .reconcile(reservation.reservation_id, 400)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::ReservationNotFound(_)));
    assert_eq!(tenant_used(&engine, "acme").await, 0);
}

#[tokio::test]
async fn test_denied_role_and_unknown_tenant() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let viewer = AdmissionRequest::new("acme", "guest", Role::Viewer, 0);
    let denied = engine.check_and_reserve(&viewer).await.unwrap_err();
    assert_eq!(denied.reason, DenialReason::MemberDailyLimitExhausted);
    assert_eq!(denied.snapshot.member_daily_limit, Some(0));

    let stranger = AdmissionRequest::new("nobody", "alice", Role::Owner, 10);
    let denied = engine.check_and_reserve(&stranger).await.unwrap_err();
    assert_eq!(denied.reason, DenialReason::UnknownTenant);
    assert!(!denied.is_retryable());
}

#[tokio::test]
async fn test_unlimited_tenant_still_counts_usage() {
    let (_clock, engine) = setup();
    engine.register_unlimited_tenant("bigco", 1).await.unwrap();

    let request = AdmissionRequest::new("bigco", "alice", Role::Member, 5_000_000);
    engine.check_and_reserve(&request).await.unwrap();

    let summary = engine.remaining("bigco", "alice", Role::Member, 1).await.unwrap();
    assert!(summary.unlimited);
    assert_eq!(summary.tenant_remaining, None);
    assert_eq!(summary.tenant_used, 5_000_000);
    assert_eq!(summary.member_used_today, 5_000_000);
}

#[tokio::test]
async fn test_validate_does_not_reserve() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 3000, 1).await.unwrap();

    let fits = AdmissionRequest::new("acme", "alice", Role::Member, 80);
    let check = engine.validate(&fits).await;
    assert!(check.allowed);
    assert_eq!(tenant_used(&engine, "acme").await, 0);

    let too_big = AdmissionRequest::new("acme", "alice", Role::Member, 150);
    let check = engine.validate(&too_big).await;
    assert!(!check.allowed);
    assert!(check.tenant_ok);
    assert!(!check.member_ok);
    assert_eq!(check.reason, Some(DenialReason::MemberDailyLimitExhausted));
}
