use crate::clock::Clock;
use crate::error::{QuotaError, Result};
use crate::ledger::types::{
    AdjustError, AllocationKey, CounterTarget, InsufficientBudget, MemberAllocation, TenantPool,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Point-in-time copy of the ledger, used for persistence
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub pools: Vec<TenantPool>,
    pub allocations: Vec<MemberAllocation>,
}

/// Result of a conditional period reset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodReset {
    /// Counter was cleared
    Reset {
        previous_used: u64,
        previous_reset_at: DateTime<Utc>,
    },
    /// `last_reset_at` already falls inside the current period
    AlreadyCurrent,
}

/// Member rows plus a per-member index of the most recent row date
#[derive(Default)]
struct AllocationTable {
    rows: HashMap<AllocationKey, Arc<Mutex<MemberAllocation>>>,
    latest: HashMap<(String, String), NaiveDate>,
}

impl AllocationTable {
    fn insert(&mut self, row: MemberAllocation) -> Arc<Mutex<MemberAllocation>> {
        let key = row.key();
        let member = (key.tenant_id.clone(), key.member_id.clone());
        let newest = self.latest.entry(member).or_insert(key.date);
        if key.date > *newest {
            *newest = key.date;
        }
        let row = Arc::new(Mutex::new(row));
        self.rows.insert(key, Arc::clone(&row));
        row
    }
}

/// Arena of independently lockable counters
///
/// Lock order is pool → allocation table → allocation row; no path
/// acquires them in the opposite direction.
pub struct QuotaLedger {
    pools: RwLock<HashMap<String, Arc<Mutex<TenantPool>>>>,
    allocations: RwLock<AllocationTable>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    /// Create an empty ledger
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        QuotaLedger {
            pools: RwLock::new(HashMap::new()),
            allocations: RwLock::new(AllocationTable::default()),
            clock,
        }
    }

    /// Create or update a tenant pool
    ///
    /// Existing pools keep their usage and period start; only the limit
    /// and anchor change.
    pub async fn upsert_pool(
        &self,
        tenant_id: &str,
        monthly_limit: u64,
        unlimited: bool,
        period_anchor_day: u32,
    ) -> Result<TenantPool> {
        if !(1..=28).contains(&period_anchor_day) {
            return Err(QuotaError::Config(format!(
                "Period anchor day must be within 1-28, got {}",
                period_anchor_day
            )));
        }

        let mut pools = self.pools.write().await;
        if let Some(existing) = pools.get(tenant_id) {
            let mut pool = existing.lock().await;
            pool.monthly_limit = monthly_limit;
            pool.unlimited = unlimited;
            pool.period_anchor_day = period_anchor_day;
            info!(
                "Updated pool for tenant {}: limit={} unlimited={}",
                tenant_id, monthly_limit, unlimited
            );
            return Ok(pool.clone());
        }

        let mut pool = TenantPool::new(tenant_id, monthly_limit, period_anchor_day, self.clock.now());
        pool.unlimited = unlimited;
        pools.insert(tenant_id.to_string(), Arc::new(Mutex::new(pool.clone())));
        info!(
            "Registered pool for tenant {}: limit={} unlimited={} anchor_day={}",
            tenant_id, monthly_limit, unlimited, period_anchor_day
        );
        Ok(pool)
    }

    /// Insert a pool verbatim (used when restoring from storage)
    pub async fn restore_pool(&self, pool: TenantPool) {
        let mut pools = self.pools.write().await;
        pools.insert(pool.tenant_id.clone(), Arc::new(Mutex::new(pool)));
    }

    /// Insert an allocation row verbatim (used when restoring from storage)
    pub async fn restore_allocation(&self, row: MemberAllocation) {
        let mut table = self.allocations.write().await;
        table.insert(row);
    }

    /// Snapshot of a tenant pool
    pub async fn get_pool(&self, tenant_id: &str) -> Result<TenantPool> {
        let pool = self.pool_handle(tenant_id).await?;
        let pool = pool.lock().await;
        Ok(pool.clone())
    }

    /// Registered tenant ids
    pub async fn tenant_ids(&self) -> Vec<String> {
        let pools = self.pools.read().await;
        let mut ids: Vec<String> = pools.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of a member's row for `date`, creating it on first use
    ///
    /// A new row carries the member's monthly counter over from their most
    /// recent row when that row belongs to the tenant's current period.
    pub async fn get_or_create_allocation(
        &self,
        tenant_id: &str,
        member_id: &str,
        date: NaiveDate,
    ) -> Result<MemberAllocation> {
        let key = AllocationKey::new(tenant_id, member_id, date);

        {
            let table = self.allocations.read().await;
            if let Some(row) = table.rows.get(&key) {
                let row = Arc::clone(row);
                drop(table);
                let row = row.lock().await;
                return Ok(row.clone());
            }
        }

        let period_start = self.get_pool(tenant_id).await?.last_reset_at.date_naive();

        let mut table = self.allocations.write().await;
        if let Some(row) = table.rows.get(&key) {
            let row = Arc::clone(row);
            drop(table);
            let row = row.lock().await;
            return Ok(row.clone());
        }

        let member = (tenant_id.to_string(), member_id.to_string());
        let previous = table
            .latest
            .get(&member)
            .copied()
            .filter(|d| *d < date && *d >= period_start)
            .and_then(|d| table.rows.get(&AllocationKey::new(tenant_id, member_id, d)))
            .cloned();

        let mut row = MemberAllocation::new(&key);
        if let Some(previous) = previous {
            row.tokens_used_this_month = previous.lock().await.tokens_used_this_month;
        }

        debug!(
            "Created allocation row for {}/{} on {} (month carry-over {})",
            tenant_id, member_id, date, row.tokens_used_this_month
        );
        table.insert(row.clone());
        Ok(row)
    }

    /// Snapshot of an existing row
    pub async fn find_allocation(&self, key: &AllocationKey) -> Option<MemberAllocation> {
        let row = {
            let table = self.allocations.read().await;
            table.rows.get(key).cloned()
        }?;
        let row = row.lock().await;
        Some(row.clone())
    }

    /// Record the derived daily limit on a row
    pub async fn set_daily_limit(&self, key: &AllocationKey, daily_limit: Option<u64>) -> Result<()> {
        let row = self.allocation_handle(key).await.ok_or_else(|| {
            QuotaError::Storage(format!(
                "No allocation row for {}/{} on {}",
                key.tenant_id, key.member_id, key.date
            ))
        })?;
        row.lock().await.daily_limit = daily_limit;
        Ok(())
    }

    /// Adjust a tenant's period counter; returns the new value and the
    /// start of the period it was charged to, both read under the pool lock
    pub async fn adjust_pool(
        &self,
        tenant_id: &str,
        delta: i64,
        ceiling: Option<u64>,
    ) -> std::result::Result<(u64, DateTime<Utc>), AdjustError> {
        let pool = self
            .pool_handle(tenant_id)
            .await
            .map_err(|_| AdjustError::UnknownTarget(CounterTarget::TenantPeriod(tenant_id.to_string())))?;
        let mut pool = pool.lock().await;
        let next = apply_delta(pool.tokens_used_this_period, delta, ceiling)?;
        pool.tokens_used_this_period = next;
        Ok((next, pool.last_reset_at))
    }

    /// Compare-and-update a single counter
    ///
    /// Positive deltas that would push the counter above `ceiling` are
    /// rejected and leave the counter unchanged. Negative deltas always
    /// apply and saturate at zero. `ceiling = None` never rejects.
    pub async fn atomic_adjust(
        &self,
        target: &CounterTarget,
        delta: i64,
        ceiling: Option<u64>,
    ) -> std::result::Result<u64, AdjustError> {
        match target {
            CounterTarget::TenantPeriod(tenant_id) => self
                .adjust_pool(tenant_id, delta, ceiling)
                .await
                .map(|(next, _)| next),
            CounterTarget::MemberDaily(key) => {
                let row = self
                    .allocation_handle(key)
                    .await
                    .ok_or_else(|| AdjustError::UnknownTarget(target.clone()))?;
                let mut row = row.lock().await;
                let next = apply_delta(row.tokens_used_today, delta, ceiling)?;
                row.tokens_used_today = next;
                row.tokens_used_this_month = apply_delta(row.tokens_used_this_month, delta, None)?;
                if delta > 0 {
                    row.last_used_at = Some(self.clock.now());
                }
                Ok(next)
            }
        }
    }

    /// Clear a tenant's period counter unless it was already reset after
    /// `period_start`
    ///
    /// The check and the reset happen under the pool lock, so concurrent
    /// sweeps reset at most once. Monthly counters on the rows for
    /// `now`'s date restart with the period.
    pub async fn reset_period_if_due(
        &self,
        tenant_id: &str,
        period_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PeriodReset> {
        let pool = self.pool_handle(tenant_id).await?;
        let mut pool = pool.lock().await;

        if pool.last_reset_at > now {
            return Err(QuotaError::InvalidPeriodState {
                tenant_id: tenant_id.to_string(),
                reason: format!(
                    "last reset {} is ahead of the current time {}",
                    pool.last_reset_at, now
                ),
            });
        }

        if pool.last_reset_at >= period_start {
            return Ok(PeriodReset::AlreadyCurrent);
        }

        let outcome = PeriodReset::Reset {
            previous_used: pool.tokens_used_this_period,
            previous_reset_at: pool.last_reset_at,
        };
        pool.tokens_used_this_period = 0;
        pool.last_reset_at = now;

        let today = now.date_naive();
        let open_rows: Vec<_> = {
            let table = self.allocations.read().await;
            table
                .rows
                .iter()
                .filter(|(key, _)| key.tenant_id == tenant_id && key.date == today)
                .map(|(_, row)| Arc::clone(row))
                .collect()
        };
        for row in open_rows {
            row.lock().await.tokens_used_this_month = 0;
        }

        Ok(outcome)
    }

    /// Drop rows dated before `cutoff`; returns how many were removed
    pub async fn purge_allocations_before(&self, cutoff: NaiveDate) -> usize {
        let mut table = self.allocations.write().await;
        let before = table.rows.len();
        table.rows.retain(|key, _| key.date >= cutoff);
        table.latest.retain(|_, date| *date >= cutoff);
        before - table.rows.len()
    }

    /// All rows of a tenant, oldest first
    pub async fn allocations_for(&self, tenant_id: &str) -> Vec<MemberAllocation> {
        let handles: Vec<_> = {
            let table = self.allocations.read().await;
            table
                .rows
                .iter()
                .filter(|(key, _)| key.tenant_id == tenant_id)
                .map(|(_, row)| Arc::clone(row))
                .collect()
        };
        let mut rows = Vec::with_capacity(handles.len());
        for row in handles {
            rows.push(row.lock().await.clone());
        }
        rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.member_id.cmp(&b.member_id)));
        rows
    }

    /// Number of stored member rows
    pub async fn allocation_count(&self) -> usize {
        self.allocations.read().await.rows.len()
    }

    /// Copy the whole ledger
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let pool_handles: Vec<_> = self.pools.read().await.values().cloned().collect();
        let mut pools = Vec::with_capacity(pool_handles.len());
        for pool in pool_handles {
            pools.push(pool.lock().await.clone());
        }
        pools.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));

        let row_handles: Vec<_> = self.allocations.read().await.rows.values().cloned().collect();
        let mut allocations = Vec::with_capacity(row_handles.len());
        for row in row_handles {
            allocations.push(row.lock().await.clone());
        }
        allocations.sort_by(|a, b| {
            (&a.tenant_id, &a.member_id, a.date).cmp(&(&b.tenant_id, &b.member_id, b.date))
        });

        LedgerSnapshot { pools, allocations }
    }

    async fn pool_handle(&self, tenant_id: &str) -> Result<Arc<Mutex<TenantPool>>> {
        let pools = self.pools.read().await;
        pools
            .get(tenant_id)
            .cloned()
            .ok_or_else(|| QuotaError::TenantNotFound(tenant_id.to_string()))
    }

    async fn allocation_handle(&self, key: &AllocationKey) -> Option<Arc<Mutex<MemberAllocation>>> {
        let table = self.allocations.read().await;
        table.rows.get(key).cloned()
    }
}

fn apply_delta(current: u64, delta: i64, ceiling: Option<u64>) -> std::result::Result<u64, InsufficientBudget> {
    if delta < 0 {
        return Ok(current.saturating_sub(delta.unsigned_abs()));
    }

    let requested = delta as u64;
    let next = current.saturating_add(requested);
    match ceiling {
        Some(ceiling) if next > ceiling => Err(InsufficientBudget {
            current,
            requested,
            ceiling,
        }),
        _ => Ok(next),
    }
}
