use crate::admission::book::signed;
use crate::admission::{CloseOutcome, ReconcileOutcome, Reservation, ReservationBook, TokenUsage};
use crate::clock::Clock;
use crate::error::Result;
use crate::ledger::{AllocationKey, CounterTarget, QuotaLedger};
use crate::usage::rate::UsageRateTracker;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    /// Reservations released with a full refund
    pub expired: Vec<Reservation>,
    /// Closed reservations forgotten after the retention window
    pub purged: usize,
}

/// Applies actual usage to the ledger once metered work completes
pub struct UsageRecorder {
    ledger: Arc<QuotaLedger>,
    book: Arc<ReservationBook>,
    rates: Arc<UsageRateTracker>,
    clock: Arc<dyn Clock>,
    closed_retention: Duration,
}

impl UsageRecorder {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        book: Arc<ReservationBook>,
        rates: Arc<UsageRateTracker>,
        clock: Arc<dyn Clock>,
        closed_retention: Duration,
    ) -> Self {
        UsageRecorder {
            ledger,
            book,
            rates,
            clock,
            closed_retention,
        }
    }

    /// Close a reservation with the amount actually consumed
    ///
    /// The difference to the reserved amount is applied to tenant and
    /// member counters without a ceiling. Repeated calls return the first
    /// outcome and leave the ledger alone.
    pub async fn reconcile(&self, reservation_id: Uuid, actual_amount: u64) -> Result<ReconcileOutcome> {
        self.close(reservation_id, actual_amount, None).await
    }

    /// `reconcile` with the input/output split; the total is charged
    pub async fn reconcile_usage(&self, reservation_id: Uuid, usage: TokenUsage) -> Result<ReconcileOutcome> {
        self.close(reservation_id, usage.total(), Some(usage)).await
    }

    async fn close(
        &self,
        reservation_id: Uuid,
        actual_amount: u64,
        usage: Option<TokenUsage>,
    ) -> Result<ReconcileOutcome> {
        let now = self.clock.now();

        match self
            .book
            .close_reconciled(reservation_id, actual_amount, usage, now)
            .await
        {
            Ok(CloseOutcome::Closed(reservation, outcome)) => {
                self.apply_correction(&reservation, outcome.delta, now).await;
                self.rates.record(&reservation.tenant_id, actual_amount, now).await;
                info!(
                    "Reconciled reservation {} for {}/{}: reserved={} actual={}",
                    reservation_id,
                    reservation.tenant_id,
                    reservation.member_id,
                    reservation.amount_reserved,
                    actual_amount
                );
                Ok(outcome)
            }
            Ok(CloseOutcome::AlreadyReconciled(outcome)) => {
                debug!("Reservation {} already reconciled", reservation_id);
                Ok(outcome)
            }
            Err(e) => {
                warn!("Reconcile for unknown or expired reservation {}", reservation_id);
                Err(e)
            }
        }
    }

    /// Release reservations whose holders never reported back
    ///
    /// Each is treated as `actual = 0`: the full reserved amount goes back
    /// to the pool and the member's day. Closed reservations older than
    /// the retention window are forgotten.
    pub async fn expire_stale(&self) -> ExpirySweep {
        let now = self.clock.now();
        let expired = self.book.take_expired(now).await;

        for reservation in &expired {
            warn!(
                "Reservation {} for {}/{} expired unreconciled; refunding {} tokens",
                reservation.reservation_id,
                reservation.tenant_id,
                reservation.member_id,
                reservation.amount_reserved
            );
            self.apply_correction(reservation, -signed(reservation.amount_reserved), now)
                .await;
        }

        let purged = self.book.purge_closed(now - self.closed_retention).await;
        if purged > 0 {
            debug!("Purged {} closed reservations", purged);
        }

        ExpirySweep { expired, purged }
    }

    /// Apply `delta` to the counters a reservation was charged to
    ///
    /// A refund only reaches a counter whose period (tenant) or day
    /// (member) is the one originally charged; additional usage always
    /// lands in the current period and day.
    async fn apply_correction(&self, reservation: &Reservation, delta: i64, now: DateTime<Utc>) {
        if delta == 0 {
            return;
        }

        match self.ledger.get_pool(&reservation.tenant_id).await {
            Ok(pool) if delta < 0 && pool.last_reset_at != reservation.period_started_at => {
                debug!(
                    "Dropping refund of {} for tenant {}: period rolled over",
                    -delta, reservation.tenant_id
                );
            }
            Ok(_) => {
                let target = CounterTarget::TenantPeriod(reservation.tenant_id.clone());
                if let Err(e) = self.ledger.atomic_adjust(&target, delta, None).await {
                    warn!("Tenant correction failed for {}: {}", reservation.tenant_id, e);
                }
            }
            Err(e) => warn!("Tenant correction skipped: {}", e),
        }

        let today = now.date_naive();
        let key = if reservation.allocation_date == today {
            AllocationKey::new(
                reservation.tenant_id.clone(),
                reservation.member_id.clone(),
                today,
            )
        } else if delta > 0 {
            match self
                .ledger
                .get_or_create_allocation(&reservation.tenant_id, &reservation.member_id, today)
                .await
            {
                Ok(row) => row.key(),
                Err(e) => {
                    warn!("Member correction skipped: {}", e);
                    return;
                }
            }
        } else {
            debug!(
                "Dropping refund of {} for {}/{}: day {} is closed",
                -delta, reservation.tenant_id, reservation.member_id, reservation.allocation_date
            );
            return;
        };

        let target = CounterTarget::MemberDaily(key);
        if let Err(e) = self.ledger.atomic_adjust(&target, delta, None).await {
            warn!(
                "Member correction failed for {}/{}: {}",
                reservation.tenant_id, reservation.member_id, e
            );
        }
    }
}
