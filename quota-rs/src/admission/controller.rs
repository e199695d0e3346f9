use crate::admission::book::{signed, ReservationBook};
use crate::admission::types::{
    AdmissionCheck, AdmissionDenied, AdmissionRequest, BudgetSnapshot, DenialReason, Reservation,
};
use crate::allocation::RoleLimitPolicy;
use crate::clock::Clock;
use crate::ledger::{AllocationKey, CounterTarget, QuotaLedger, TenantPool};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Check-then-reserve gate in front of every metered operation
pub struct AdmissionController {
    ledger: Arc<QuotaLedger>,
    book: Arc<ReservationBook>,
    policy: RoleLimitPolicy,
    clock: Arc<dyn Clock>,
    reservation_timeout: Duration,
}

impl AdmissionController {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        book: Arc<ReservationBook>,
        policy: RoleLimitPolicy,
        clock: Arc<dyn Clock>,
        reservation_timeout: Duration,
    ) -> Self {
        AdmissionController {
            ledger,
            book,
            policy,
            clock,
            reservation_timeout,
        }
    }

    pub fn policy(&self) -> &RoleLimitPolicy {
        &self.policy
    }

    /// Reserve `estimated_tokens` against the tenant pool and the member's
    /// daily allocation
    ///
    /// Both counters are bumped through `atomic_adjust`; if the member
    /// bump fails after the tenant bump succeeded, the tenant bump is
    /// rolled back and the request is denied as a lost race.
    pub async fn check_and_reserve(
        &self,
        request: &AdmissionRequest,
    ) -> Result<Reservation, AdmissionDenied> {
        let now = self.clock.now();
        let today = now.date_naive();
        let estimated = request.estimated_tokens;

        let Ok(pool) = self.ledger.get_pool(&request.tenant_id).await else {
            return Err(self.deny(DenialReason::UnknownTenant, request, None).await);
        };

        if !tenant_has_room(&pool, estimated) {
            return Err(self
                .deny(DenialReason::TenantBudgetExhausted, request, None)
                .await);
        }

        let daily_limit =
            self.policy
                .daily_limit(&pool, request.role, request.active_members_in_role);
        let Ok(allocation) = self
            .ledger
            .get_or_create_allocation(&request.tenant_id, &request.member_id, today)
            .await
        else {
            return Err(self.deny(DenialReason::UnknownTenant, request, daily_limit).await);
        };
        let key = allocation.key();
        if allocation.daily_limit != daily_limit {
            if let Err(e) = self.ledger.set_daily_limit(&key, daily_limit).await {
                warn!("Could not record daily limit for {}/{}: {}", key.tenant_id, key.member_id, e);
            }
        }

        if !member_has_room(daily_limit, allocation.tokens_used_today, estimated) {
            return Err(self
                .deny(DenialReason::MemberDailyLimitExhausted, request, daily_limit)
                .await);
        }

        let tenant_target = CounterTarget::TenantPeriod(request.tenant_id.clone());
        let period_started_at = match self
            .ledger
            .adjust_pool(&request.tenant_id, signed(estimated), pool.ceiling())
            .await
        {
            Ok((_, period_started_at)) => period_started_at,
            Err(e) => {
                debug!("Tenant reservation for {} lost race: {}", request.tenant_id, e);
                return Err(self
                    .deny(DenialReason::ConcurrentReservationLost, request, daily_limit)
                    .await);
            }
        };

        let member_target = CounterTarget::MemberDaily(key);
        if let Err(e) = self
            .ledger
            .atomic_adjust(&member_target, signed(estimated), daily_limit)
            .await
        {
            debug!(
                "Member reservation for {}/{} lost race: {}",
                request.tenant_id, request.member_id, e
            );
            if let Err(rollback) = self
                .ledger
                .atomic_adjust(&tenant_target, -signed(estimated), None)
                .await
            {
                warn!("Rollback failed for tenant {}: {}", request.tenant_id, rollback);
            }
            return Err(self
                .deny(DenialReason::ConcurrentReservationLost, request, daily_limit)
                .await);
        }

        let reservation = Reservation {
            reservation_id: Uuid::new_v4(),
            tenant_id: request.tenant_id.clone(),
            member_id: request.member_id.clone(),
            amount_reserved: estimated,
            allocation_date: today,
            period_started_at,
            created_at: now,
            expires_at: now + self.reservation_timeout,
        };
        self.book.insert(reservation.clone()).await;

        debug!(
            "Reserved {} tokens for {}/{} ({})",
            estimated, request.tenant_id, request.member_id, reservation.reservation_id
        );
        Ok(reservation)
    }

    /// Run the tenant and member checks without reserving anything
    pub async fn check(&self, request: &AdmissionRequest) -> AdmissionCheck {
        let estimated = request.estimated_tokens;
        let Ok(pool) = self.ledger.get_pool(&request.tenant_id).await else {
            return AdmissionCheck {
                allowed: false,
                tenant_ok: false,
                member_ok: false,
                reason: Some(DenialReason::UnknownTenant),
                snapshot: self.snapshot(request, None).await,
            };
        };

        let daily_limit =
            self.policy
                .daily_limit(&pool, request.role, request.active_members_in_role);
        let snapshot = self.snapshot(request, daily_limit).await;

        let tenant_ok = tenant_has_room(&pool, estimated);
        let member_ok = member_has_room(daily_limit, snapshot.member_used_today, estimated);
        let reason = if !tenant_ok {
            Some(DenialReason::TenantBudgetExhausted)
        } else if !member_ok {
            Some(DenialReason::MemberDailyLimitExhausted)
        } else {
            None
        };

        AdmissionCheck {
            allowed: tenant_ok && member_ok,
            tenant_ok,
            member_ok,
            reason,
            snapshot,
        }
    }

    /// Remaining tenant and member budget as currently recorded
    pub async fn snapshot(
        &self,
        request: &AdmissionRequest,
        daily_limit: Option<u64>,
    ) -> BudgetSnapshot {
        let mut snapshot = BudgetSnapshot {
            tenant_id: request.tenant_id.clone(),
            member_id: request.member_id.clone(),
            tenant_limit: Some(0),
            tenant_remaining: Some(0),
            member_daily_limit: daily_limit,
            member_remaining_today: daily_limit,
            ..Default::default()
        };

        if let Ok(pool) = self.ledger.get_pool(&request.tenant_id).await {
            snapshot.tenant_limit = pool.ceiling();
            snapshot.tenant_used = pool.tokens_used_this_period;
            snapshot.tenant_remaining = pool.remaining();
        }

        let key = AllocationKey::new(
            request.tenant_id.clone(),
            request.member_id.clone(),
            self.clock.today(),
        );
        if let Some(row) = self.ledger.find_allocation(&key).await {
            snapshot.member_used_today = row.tokens_used_today;
            snapshot.member_remaining_today =
                daily_limit.map(|limit| limit.saturating_sub(row.tokens_used_today));
        }

        snapshot
    }

    async fn deny(
        &self,
        reason: DenialReason,
        request: &AdmissionRequest,
        daily_limit: Option<u64>,
    ) -> AdmissionDenied {
        debug!(
            "Denied {} tokens for {}/{}: {}",
            request.estimated_tokens, request.tenant_id, request.member_id, reason
        );
        AdmissionDenied {
            reason,
            snapshot: self.snapshot(request, daily_limit).await,
        }
    }
}

fn tenant_has_room(pool: &TenantPool, estimated: u64) -> bool {
    match pool.ceiling() {
        None => true,
        Some(limit) => pool
            .tokens_used_this_period
            .checked_add(estimated)
            .is_some_and(|total| total <= limit),
    }
}

/// A zero daily limit denies every request, including zero-token estimates
fn member_has_room(daily_limit: Option<u64>, used_today: u64, estimated: u64) -> bool {
    match daily_limit {
        None => true,
        Some(0) => false,
        Some(limit) => used_today
            .checked_add(estimated)
            .is_some_and(|total| total <= limit),
    }
}
