//! Engine facade
//!
//! Wires the ledger, admission, usage, reset, notification and overflow
//! components together:
//!
//! ```text
//! check_and_reserve ──► [Admission] ──► Reservation ──► metered work
//!        │ denied                                           │
//!        ▼                                                  ▼
//!   [Overflow queue] ◄── drain_overflow             reconcile(actual)
//!                                                           │
//!              [Notifications] ◄── after every reserve/reconcile
//! ```

use crate::admission::{
    AdmissionCheck, AdmissionController, AdmissionDenied, AdmissionRequest, ReconcileOutcome,
    Reservation, ReservationBook, TokenUsage,
};
use crate::allocation::Role;
use crate::clock::Clock;
use crate::config::{Config, TenantSeed};
use crate::error::{QuotaError, Result};
use crate::ledger::{AllocationKey, MemberAllocation, QuotaLedger, TenantPool};
use crate::notify::{NotificationEngine, NotificationSink, UsageNotification};
use crate::overflow::{OverflowQueue, QueuedRequest};
use crate::persistence::StoreSnapshot;
use crate::reset::{next_period_start, DailySweepReport, MonthlySweepReport, ResetScheduler};
use crate::usage::{ExpirySweep, UsageRateTracker, UsageRecorder};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// What a queued request needs to be admitted later
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAdmission {
    pub role: Role,
    pub active_members_in_role: u32,
    /// Opaque caller payload, handed back when the request is admitted
    pub payload: serde_json::Value,
}

/// Remaining budget for one member within a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub tenant_id: String,
    pub member_id: String,
    pub role: Role,
    pub tenant_limit: Option<u64>,
    pub tenant_used: u64,
    pub tenant_remaining: Option<u64>,
    pub usage_percent: f64,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub member_daily_limit: Option<u64>,
    pub member_used_today: u64,
    pub member_remaining_today: Option<u64>,
    /// Reporting only; admission enforces the daily limit
    pub member_monthly_limit: Option<u64>,
    pub member_used_this_month: u64,
    pub unlimited: bool,
}

/// Tenant pool with today's member rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantUsage {
    pub pool: TenantPool,
    pub members_today: Vec<MemberAllocation>,
    /// Tokens held by reservations not yet reconciled
    pub open_reserved: u64,
    pub queued_requests: usize,
}

/// Outcome of one maintenance pass
#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub expired_reservations: usize,
    pub queue_timeouts: usize,
    pub daily: Option<DailySweepReport>,
    pub monthly: Option<MonthlySweepReport>,
}

/// Quota accounting engine
///
/// Counter changes (reserve, reconcile, expiry, sweeps) run under the
/// shared side of `gate`; `snapshot` and `restore` take the exclusive side
/// so the ledger and the reservation book are always seen together.
/// Gated methods never call each other while holding the gate.
pub struct QuotaEngine {
    gate: RwLock<()>,
    clock: Arc<dyn Clock>,
    ledger: Arc<QuotaLedger>,
    book: Arc<ReservationBook>,
    rates: Arc<UsageRateTracker>,
    admission: AdmissionController,
    recorder: UsageRecorder,
    scheduler: ResetScheduler,
    notifications: NotificationEngine,
    overflow: OverflowQueue<QueuedAdmission>,
    max_admission_attempts: u32,
    retry_jitter_ms: u64,
}

impl QuotaEngine {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let ledger = Arc::new(QuotaLedger::new(clock.clone()));
        let book = Arc::new(ReservationBook::new());
        let rates = Arc::new(UsageRateTracker::new(config.overflow.drain_rate_window()));

        let admission = AdmissionController::new(
            ledger.clone(),
            book.clone(),
            config.roles.clone(),
            clock.clone(),
            config.engine.reservation_timeout(),
        );
        let recorder = UsageRecorder::new(
            ledger.clone(),
            book.clone(),
            rates.clone(),
            clock.clone(),
            config.engine.closed_reservation_retention(),
        );
        let scheduler = ResetScheduler::new(
            ledger.clone(),
            clock.clone(),
            config.engine.allocation_retention_days,
        );
        let notifications = NotificationEngine::new(
            ledger.clone(),
            clock.clone(),
            config.notifications.thresholds(),
        );
        let overflow = OverflowQueue::new(
            rates.clone(),
            clock.clone(),
            config.overflow.queue_settings(),
        );

        QuotaEngine {
            gate: RwLock::new(()),
            clock,
            ledger,
            book,
            rates,
            admission,
            recorder,
            scheduler,
            notifications,
            overflow,
            max_admission_attempts: config.engine.max_admission_attempts.max(1),
            retry_jitter_ms: config.engine.retry_jitter_ms,
        }
    }

    /// Attach a notification sink
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications.add_sink(sink);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Create a tenant pool or update its limit; usage is preserved
    pub async fn register_tenant(
        &self,
        tenant_id: &str,
        monthly_limit: u64,
        period_anchor_day: u32,
    ) -> Result<TenantPool> {
        self.ledger
            .upsert_pool(tenant_id, monthly_limit, false, period_anchor_day)
            .await
    }

    pub async fn register_unlimited_tenant(
        &self,
        tenant_id: &str,
        period_anchor_day: u32,
    ) -> Result<TenantPool> {
        self.ledger
            .upsert_pool(tenant_id, 0, true, period_anchor_day)
            .await
    }

    /// Change the monthly limit of an existing tenant
    pub async fn set_monthly_limit(&self, tenant_id: &str, monthly_limit: u64) -> Result<TenantPool> {
        let pool = self.ledger.get_pool(tenant_id).await?;
        self.ledger
            .upsert_pool(tenant_id, monthly_limit, false, pool.period_anchor_day)
            .await
    }

    /// Register configured tenants that are not known yet; returns how
    /// many were added
    pub async fn seed_tenants(&self, seeds: &[TenantSeed]) -> Result<usize> {
        let mut added = 0;
        for seed in seeds {
            if self.ledger.get_pool(&seed.tenant_id).await.is_ok() {
                continue;
            }
            self.ledger
                .upsert_pool(
                    &seed.tenant_id,
                    seed.monthly_limit,
                    seed.unlimited,
                    seed.period_anchor_day,
                )
                .await?;
            added += 1;
        }
        Ok(added)
    }

    /// Admit a request, then evaluate thresholds for the tenant and member
    pub async fn check_and_reserve(
        &self,
        request: &AdmissionRequest,
    ) -> std::result::Result<Reservation, AdmissionDenied> {
        let reservation = {
            let _gate = self.gate.read().await;
            self.admission.check_and_reserve(request).await?
        };
        self.notifications
            .evaluate(&request.tenant_id, Some(&request.member_id))
            .await;
        Ok(reservation)
    }

    /// `check_and_reserve`, retrying lost races with a random pause
    pub async fn reserve_with_retry(
        &self,
        request: &AdmissionRequest,
    ) -> std::result::Result<Reservation, AdmissionDenied> {
        let mut attempt = 1;
        loop {
            match self.check_and_reserve(request).await {
                Err(denied) if denied.is_retryable() && attempt < self.max_admission_attempts => {
                    let jitter = rand::thread_rng().gen_range(0..=self.retry_jitter_ms);
                    debug!(
                        "Retrying reservation for {}/{} (attempt {}) after {}ms",
                        request.tenant_id, request.member_id, attempt, jitter
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Dry-run admission
    pub async fn validate(&self, request: &AdmissionRequest) -> AdmissionCheck {
        self.admission.check(request).await
    }

    /// Record actual usage for a reservation
    pub async fn reconcile(&self, reservation_id: Uuid, actual_amount: u64) -> Result<ReconcileOutcome> {
        let outcome = {
            let _gate = self.gate.read().await;
            self.recorder.reconcile(reservation_id, actual_amount).await?
        };
        self.notifications
            .evaluate(&outcome.tenant_id, Some(&outcome.member_id))
            .await;
        Ok(outcome)
    }

    /// Record actual usage split into input and output tokens
    pub async fn reconcile_usage(&self, reservation_id: Uuid, usage: TokenUsage) -> Result<ReconcileOutcome> {
        let outcome = {
            let _gate = self.gate.read().await;
            self.recorder.reconcile_usage(reservation_id, usage).await?
        };
        self.notifications
            .evaluate(&outcome.tenant_id, Some(&outcome.member_id))
            .await;
        Ok(outcome)
    }

    /// Evaluate thresholds without any counter change
    pub async fn evaluate_notifications(
        &self,
        tenant_id: &str,
        member_id: Option<&str>,
    ) -> Vec<UsageNotification> {
        self.notifications.evaluate(tenant_id, member_id).await
    }

    /// Refund reservations past their expiry
    pub async fn expire_stale(&self) -> ExpirySweep {
        let _gate = self.gate.read().await;
        self.recorder.expire_stale().await
    }

    pub async fn run_daily_sweep(&self) -> DailySweepReport {
        let _gate = self.gate.read().await;
        let report = self.scheduler.daily_sweep().await;
        if !report.skipped {
            self.notifications.prune().await;
            self.rates.cleanup(self.clock.now()).await;
        }
        report
    }

    pub async fn run_monthly_sweep(&self) -> MonthlySweepReport {
        let _gate = self.gate.read().await;
        let report = self.scheduler.monthly_sweep().await;
        if !report.reset.is_empty() {
            self.notifications.prune().await;
        }
        report
    }

    /// Expire reservations, time out queued requests and run both sweeps
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let expired = self.expire_stale().await;
        let timeouts = self.purge_expired_queue().await;
        let daily = self.run_daily_sweep().await;
        let monthly = self.run_monthly_sweep().await;

        MaintenanceReport {
            expired_reservations: expired.expired.len(),
            queue_timeouts: timeouts.len(),
            daily: Some(daily),
            monthly: Some(monthly),
        }
    }

    /// Remaining budget for a member (tenant pool, day and month)
    pub async fn remaining(
        &self,
        tenant_id: &str,
        member_id: &str,
        role: Role,
        active_members_in_role: u32,
    ) -> Result<UsageSummary> {
        let pool = self.ledger.get_pool(tenant_id).await?;
        let now = self.clock.now();
        let policy = self.admission.policy();
        let daily_limit = policy.daily_limit(&pool, role, active_members_in_role);
        let monthly_limit = policy.monthly_limit(&pool, role, active_members_in_role);

        let today = AllocationKey::new(tenant_id, member_id, now.date_naive());
        let (used_today, used_this_month) = match self.ledger.find_allocation(&today).await {
            Some(row) => (row.tokens_used_today, row.tokens_used_this_month),
            None => (0, self.month_usage_before_today(&pool, member_id).await),
        };

        Ok(UsageSummary {
            tenant_id: tenant_id.to_string(),
            member_id: member_id.to_string(),
            role,
            tenant_limit: pool.ceiling(),
            tenant_used: pool.tokens_used_this_period,
            tenant_remaining: pool.remaining(),
            usage_percent: pool.usage_percent(),
            next_reset_at: next_period_start(pool.period_anchor_day, now),
            member_daily_limit: daily_limit,
            member_used_today: used_today,
            member_remaining_today: daily_limit.map(|l| l.saturating_sub(used_today)),
            member_monthly_limit: monthly_limit,
            member_used_this_month: used_this_month,
            unlimited: daily_limit.is_none() && monthly_limit.is_none(),
        })
    }

    async fn month_usage_before_today(&self, pool: &TenantPool, member_id: &str) -> u64 {
        let period_start = pool.last_reset_at.date_naive();
        self.ledger
            .allocations_for(&pool.tenant_id)
            .await
            .into_iter()
            .filter(|row| row.member_id == member_id && row.date >= period_start)
            .max_by_key(|row| row.date)
            .map(|row| row.tokens_used_this_month)
            .unwrap_or(0)
    }

    /// Pool state plus today's member rows
    pub async fn tenant_usage(&self, tenant_id: &str) -> Result<TenantUsage> {
        let pool = self.ledger.get_pool(tenant_id).await?;
        let today = self.clock.today();
        let members_today = self
            .ledger
            .allocations_for(tenant_id)
            .await
            .into_iter()
            .filter(|row| row.date == today)
            .collect();

        Ok(TenantUsage {
            pool,
            members_today,
            open_reserved: self.book.open_reserved_total(tenant_id).await,
            queued_requests: self.overflow.len(tenant_id).await,
        })
    }

    /// Queue a request that was denied for lack of budget
    ///
    /// Requests that could not be admitted even with an empty pool and an
    /// unused day are refused, since they would block the queue head.
    pub async fn enqueue_overflow(
        &self,
        request: &AdmissionRequest,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let pool = self.ledger.get_pool(&request.tenant_id).await?;
        let estimated = request.estimated_tokens;
        let daily_limit = self.admission.policy().daily_limit(
            &pool,
            request.role,
            request.active_members_in_role,
        );

        let exceeded = match (pool.ceiling(), daily_limit) {
            (Some(ceiling), _) if estimated > ceiling => Some(ceiling),
            (_, Some(limit)) if limit == 0 || estimated > limit => Some(limit),
            _ => None,
        };
        if let Some(limit) = exceeded {
            debug!(
                "Refusing to queue {} tokens for {}/{}: limit {}",
                estimated, request.tenant_id, request.member_id, limit
            );
            return Err(QuotaError::Unadmittable {
                tenant_id: request.tenant_id.clone(),
                requested: estimated,
                limit,
            });
        }

        self.overflow
            .enqueue(
                &request.tenant_id,
                &request.member_id,
                request.estimated_tokens,
                QueuedAdmission {
                    role: request.role,
                    active_members_in_role: request.active_members_in_role,
                    payload,
                },
            )
            .await
    }

    pub async fn queue_position(&self, ticket_id: Uuid) -> Result<usize> {
        self.overflow.position(ticket_id).await
    }

    pub async fn estimate_wait(&self, ticket_id: Uuid) -> Result<std::time::Duration> {
        self.overflow.estimate_wait(ticket_id).await
    }

    /// Withdraw a queued request
    pub async fn remove_ticket(&self, ticket_id: Uuid) -> Result<QueuedRequest<QueuedAdmission>> {
        self.overflow
            .remove(ticket_id)
            .await
            .ok_or(QuotaError::TicketNotFound(ticket_id))
    }

    pub async fn queue_len(&self, tenant_id: &str) -> usize {
        self.overflow.len(tenant_id).await
    }

    /// Deny queued requests older than the maximum queue age
    pub async fn purge_expired_queue(&self) -> Vec<QueuedRequest<QueuedAdmission>> {
        self.overflow.purge_expired().await
    }

    /// Admit queued requests from the head of the tenant's queue until the
    /// first denial
    pub async fn drain_overflow(
        &self,
        tenant_id: &str,
    ) -> Vec<(QueuedRequest<QueuedAdmission>, Reservation)> {
        let mut admitted = Vec::new();

        while let Some(head) = self.overflow.front(tenant_id).await {
            let request = AdmissionRequest {
                tenant_id: head.tenant_id.clone(),
                member_id: head.member_id.clone(),
                role: head.payload.role,
                active_members_in_role: head.payload.active_members_in_role,
                estimated_tokens: head.estimated_tokens,
            };

            let reservation = match self.check_and_reserve(&request).await {
                Ok(reservation) => reservation,
                Err(denied) => {
                    debug!(
                        "Overflow drain for {} stopped at {}: {}",
                        tenant_id, head.ticket_id, denied.reason
                    );
                    break;
                }
            };

            match self.overflow.remove(head.ticket_id).await {
                Some(request) => admitted.push((request, reservation)),
                None => {
                    // Withdrawn or drained concurrently; hand the budget back
                    if let Err(e) = self.reconcile(reservation.reservation_id, 0).await {
                        debug!("Release of unclaimed reservation failed: {}", e);
                    }
                }
            }
        }

        if !admitted.is_empty() {
            info!("Admitted {} queued requests for tenant {}", admitted.len(), tenant_id);
        }
        admitted
    }

    /// Copy of the ledger and open reservations, taken with no counter
    /// change in flight
    pub async fn snapshot(&self) -> StoreSnapshot {
        let _gate = self.gate.write().await;
        StoreSnapshot {
            ledger: self.ledger.snapshot().await,
            reservations: self.book.open_reservations().await,
        }
    }

    /// Load a stored snapshot into the engine
    ///
    /// Thresholds already crossed in the restored windows are marked as
    /// emitted so they are not announced again.
    pub async fn restore(&self, snapshot: StoreSnapshot) {
        let _gate = self.gate.write().await;
        let pools = snapshot.ledger.pools.len();
        let reservations = snapshot.reservations.len();
        for pool in snapshot.ledger.pools {
            self.ledger.restore_pool(pool).await;
        }
        for row in snapshot.ledger.allocations {
            self.ledger.restore_allocation(row).await;
        }
        for reservation in snapshot.reservations {
            self.book.insert(reservation).await;
        }
        self.notifications.prime().await;
        info!(
            "Restored {} tenant pools and {} open reservations",
            pools, reservations
        );
    }
}
