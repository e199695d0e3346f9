//! Integration tests for the overflow queue

use chrono::{Duration, TimeZone, Utc};
use quota_rs::admission::AdmissionRequest;
use quota_rs::allocation::Role;
use quota_rs::clock::ManualClock;
use quota_rs::config::Config;
use quota_rs::{QuotaEngine, QuotaError};
use serde_json::json;
use std::sync::Arc;

fn setup_with(config: Config) -> (Arc<ManualClock>, QuotaEngine) {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
    ));
    let engine = QuotaEngine::new(&config, clock.clone());
    (clock, engine)
}

fn setup() -> (Arc<ManualClock>, QuotaEngine) {
    setup_with(Config::default())
}

fn owner_request(tokens: u64) -> AdmissionRequest {
    AdmissionRequest::new("acme", "alice", Role::Owner, tokens)
}

#[tokio::test]
async fn test_queue_positions_are_fifo() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 1000, 1).await.unwrap();

    let first = engine
        .enqueue_overflow(&owner_request(100), json!({"job": 1}))
        .await
        .unwrap();
    let second = engine
        .enqueue_overflow(&owner_request(100), json!({"job": 2}))
        .await
        .unwrap();
    let third = engine
        .enqueue_overflow(&owner_request(100), json!({"job": 3}))
        .await
        .unwrap();

    assert_eq!(engine.queue_position(first).await.unwrap(), 0);
    assert_eq!(engine.queue_position(second).await.unwrap(), 1);
    assert_eq!(engine.queue_position(third).await.unwrap(), 2);
    assert_eq!(engine.queue_len("acme").await, 3);

    // No drain history yet: fixed wait per request ahead
    assert_eq!(engine.estimate_wait(first).await.unwrap().as_secs(), 0);
    let wait = engine.estimate_wait(third).await.unwrap();
    assert_eq!(wait.as_secs(), 60);

    let removed = engine.remove_ticket(second).await.unwrap();
    assert_eq!(removed.payload.payload, json!({"job": 2}));
    assert_eq!(engine.queue_position(third).await.unwrap(), 1);

    let err = engine.remove_ticket(second).await.unwrap_err();
    assert!(matches!(err, QuotaError::TicketNotFound(_)));
}

#[tokio::test]
async fn test_wait_estimate_uses_drain_rate() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 100_000, 1).await.unwrap();

    let reservation = engine.check_and_reserve(&owner_request(1500)).await.unwrap();
    engine
        .reconcile(reservation.reservation_id, 1500)
        .await
        .unwrap();

    // 1500 tokens over a 15 minute window = 100 tokens per minute
    let ticket = engine
        .enqueue_overflow(&owner_request(200), json!(null))
        .await
        .unwrap();
    let wait = engine.estimate_wait(ticket).await.unwrap();
    assert_eq!(wait.as_secs(), 120);
}

#[tokio::test]
async fn test_drain_admits_when_budget_frees() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 1000, 1).await.unwrap();

    let big = engine.check_and_reserve(&owner_request(900)).await.unwrap();

    let first = engine
        .enqueue_overflow(&owner_request(200), json!({"prompt": "a"}))
        .await
        .unwrap();
    let second = engine
        .enqueue_overflow(&owner_request(50), json!({"prompt": "b"}))
        .await
        .unwrap();

    // Head does not fit; nothing behind it jumps the line
    assert!(engine.drain_overflow("acme").await.is_empty());
    assert_eq!(engine.queue_len("acme").await, 2);

    engine.reconcile(big.reservation_id, 600).await.unwrap();

    let admitted = engine.drain_overflow("acme").await;
    assert_eq!(admitted.len(), 2);
    assert_eq!(admitted[0].0.ticket_id, first);
    assert_eq!(admitted[0].0.payload.payload, json!({"prompt": "a"}));
    assert_eq!(admitted[0].1.amount_reserved, 200);
    assert_eq!(admitted[1].0.ticket_id, second);
    assert_eq!(engine.queue_len("acme").await, 0);

    let pool = engine.ledger().get_pool("acme").await.unwrap();
    assert_eq!(pool.tokens_used_this_period, 850);
}

#[tokio::test]
async fn test_queue_depth_limit() {
    let mut config = Config::default();
    config.overflow.max_queue_depth = 2;
    let (_clock, engine) = setup_with(config);
    engine.register_tenant("acme", 1000, 1).await.unwrap();

    for _ in 0..2 {
        engine
            .enqueue_overflow(&owner_request(10), json!(null))
            .await
            .unwrap();
    }
    let err = engine
        .enqueue_overflow(&owner_request(10), json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::QueueFull(_)));
}

#[tokio::test]
async fn test_queued_requests_time_out() {
    let (clock, engine) = setup();
    engine.register_tenant("acme", 1000, 1).await.unwrap();

    let ticket = engine
        .enqueue_overflow(&owner_request(10), json!(null))
        .await
        .unwrap();

    clock.advance(Duration::hours(2));
    let err = engine.queue_position(ticket).await.unwrap_err();
    assert!(matches!(err, QuotaError::TicketExpired(_)));

    let purged = engine.purge_expired_queue().await;
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].ticket_id, ticket);

    let err = engine.queue_position(ticket).await.unwrap_err();
    assert!(matches!(err, QuotaError::TicketNotFound(_)));
}

#[tokio::test]
async fn test_enqueue_for_unknown_tenant() {
    let (_clock, engine) = setup();
    let request = AdmissionRequest::new("ghost", "alice", Role::Owner, 10);
    let err = engine.enqueue_overflow(&request, json!(null)).await.unwrap_err();
    assert!(matches!(err, QuotaError::TenantNotFound(_)));
}

#[tokio::test]
async fn test_wait_estimate_for_huge_request_is_bounded() {
    let (_clock, engine) = setup();
    engine.register_unlimited_tenant("acme", 1).await.unwrap();

    // A trickle of usage gives a tiny but non-zero drain rate
    let reservation = engine.check_and_reserve(&owner_request(1)).await.unwrap();
    engine.reconcile(reservation.reservation_id, 1).await.unwrap();

    let ticket = engine
        .enqueue_overflow(&owner_request(1_000_000_000_000_000_000), json!(null))
        .await
        .unwrap();
    let wait = engine.estimate_wait(ticket).await.unwrap();
    assert_eq!(wait.as_secs(), 3600);
}

#[tokio::test]
async fn test_requests_that_can_never_fit_are_not_queued() {
    let (_clock, engine) = setup();
    engine.register_tenant("acme", 1000, 1).await.unwrap();

    let err = engine
        .enqueue_overflow(&owner_request(1001), json!(null))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        QuotaError::Unadmittable {
            requested: 1001,
            limit: 1000,
            ..
        }
    ));

    let viewer = AdmissionRequest::new("acme", "guest", Role::Viewer, 10);
    let err = engine.enqueue_overflow(&viewer, json!(null)).await.unwrap_err();
    assert!(matches!(err, QuotaError::Unadmittable { limit: 0, .. }));

    // Nothing blocks the queue for a request that does fit
    assert_eq!(engine.queue_len("acme").await, 0);
    let ticket = engine
        .enqueue_overflow(&owner_request(1000), json!(null))
        .await
        .unwrap();
    assert_eq!(engine.queue_position(ticket).await.unwrap(), 0);
}
