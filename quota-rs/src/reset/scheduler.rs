use crate::clock::Clock;
use crate::error::QuotaError;
use crate::ledger::{PeriodReset, QuotaLedger};
use crate::reset::period::{current_period_start, periods_elapsed};
use chrono::{Duration, NaiveDate};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Outcome of a daily sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySweepReport {
    pub date: NaiveDate,
    /// Rows older than the retention window that were removed
    pub purged_rows: usize,
    /// True when the sweep already ran for `date`
    pub skipped: bool,
}

/// One tenant whose period counter was cleared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantReset {
    pub tenant_id: String,
    pub previous_used: u64,
    /// Period boundaries crossed since the previous reset (> 1 = missed runs)
    pub periods_elapsed: u32,
}

/// Outcome of a monthly sweep
#[derive(Debug, Default)]
pub struct MonthlySweepReport {
    pub reset: Vec<TenantReset>,
    pub already_current: usize,
    /// Tenants whose period state is inconsistent; operational alerts only
    pub invalid: Vec<QuotaError>,
}

/// Rolls daily and monthly counters over
///
/// Both sweeps are meant to be invoked by an external timer and are safe
/// to run any number of times.
pub struct ResetScheduler {
    ledger: Arc<QuotaLedger>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    last_daily_sweep: Mutex<Option<NaiveDate>>,
}

impl ResetScheduler {
    pub fn new(ledger: Arc<QuotaLedger>, clock: Arc<dyn Clock>, retention_days: u32) -> Self {
        ResetScheduler {
            ledger,
            clock,
            retention: Duration::days(i64::from(retention_days)),
            last_daily_sweep: Mutex::new(None),
        }
    }

    /// Age out member rows older than the retention window
    ///
    /// Rows are per date, so a new day needs no counter mutation; this only
    /// garbage-collects history. Runs at most once per UTC date.
    pub async fn daily_sweep(&self) -> DailySweepReport {
        let today = self.clock.today();
        let mut last = self.last_daily_sweep.lock().await;

        if *last == Some(today) {
            return DailySweepReport {
                date: today,
                purged_rows: 0,
                skipped: true,
            };
        }

        let cutoff = today - self.retention;
        let purged_rows = self.ledger.purge_allocations_before(cutoff).await;
        *last = Some(today);

        info!(
            "Daily sweep for {}: purged {} allocation rows before {}",
            today, purged_rows, cutoff
        );

        DailySweepReport {
            date: today,
            purged_rows,
            skipped: false,
        }
    }

    /// Clear period counters of every tenant whose anchor boundary has passed
    /// since its last reset
    ///
    /// Missed boundaries (scheduler downtime) collapse into one reset.
    pub async fn monthly_sweep(&self) -> MonthlySweepReport {
        let now = self.clock.now();
        let mut report = MonthlySweepReport::default();

        for tenant_id in self.ledger.tenant_ids().await {
            let pool = match self.ledger.get_pool(&tenant_id).await {
                Ok(pool) => pool,
                Err(e) => {
                    report.invalid.push(e);
                    continue;
                }
            };

            let Some(period_start) = current_period_start(pool.period_anchor_day, now) else {
                let err = QuotaError::InvalidPeriodState {
                    tenant_id: tenant_id.clone(),
                    reason: format!("anchor day {} is outside 1-28", pool.period_anchor_day),
                };
                error!("Monthly sweep: {}", err);
                report.invalid.push(err);
                continue;
            };

            let elapsed =
                periods_elapsed(pool.period_anchor_day, pool.last_reset_at, now).unwrap_or(0);

            match self
                .ledger
                .reset_period_if_due(&tenant_id, period_start, now)
                .await
            {
                Ok(PeriodReset::Reset { previous_used, .. }) => {
                    if elapsed > 1 {
                        warn!(
                            "Tenant {} missed {} period resets; applying a single reset",
                            tenant_id,
                            elapsed - 1
                        );
                    }
                    info!(
                        "Reset period for tenant {} ({} tokens used in previous period)",
                        tenant_id, previous_used
                    );
                    report.reset.push(TenantReset {
                        tenant_id,
                        previous_used,
                        periods_elapsed: elapsed,
                    });
                }
                Ok(PeriodReset::AlreadyCurrent) => report.already_current += 1,
                Err(e) => {
                    error!("Monthly sweep: {}", e);
                    report.invalid.push(e);
                }
            }
        }

        report
    }
}
