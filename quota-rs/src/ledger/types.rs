use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Monthly token pool shared by every member of a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantPool {
    pub tenant_id: String,
    /// Tokens available per period (ignored when `unlimited`)
    pub monthly_limit: u64,
    pub unlimited: bool,
    /// Tokens committed or reserved in the current period
    pub tokens_used_this_period: u64,
    /// Day of month (1-28) on which the period rolls over
    pub period_anchor_day: u32,
    /// Start of the current period
    pub last_reset_at: DateTime<Utc>,
}

impl TenantPool {
    pub fn new(
        tenant_id: impl Into<String>,
        monthly_limit: u64,
        period_anchor_day: u32,
        now: DateTime<Utc>,
    ) -> Self {
        TenantPool {
            tenant_id: tenant_id.into(),
            monthly_limit,
            unlimited: false,
            tokens_used_this_period: 0,
            period_anchor_day,
            last_reset_at: now,
        }
    }

    pub fn unlimited(tenant_id: impl Into<String>, period_anchor_day: u32, now: DateTime<Utc>) -> Self {
        TenantPool {
            unlimited: true,
            ..TenantPool::new(tenant_id, 0, period_anchor_day, now)
        }
    }

    /// Admission ceiling for the period counter (`None` = unlimited)
    pub fn ceiling(&self) -> Option<u64> {
        if self.unlimited {
            None
        } else {
            Some(self.monthly_limit)
        }
    }

    /// Tokens left this period (`None` = unlimited)
    pub fn remaining(&self) -> Option<u64> {
        self.ceiling()
            .map(|limit| limit.saturating_sub(self.tokens_used_this_period))
    }

    /// Usage percentage of the monthly limit
    pub fn usage_percent(&self) -> f64 {
        if self.unlimited || self.monthly_limit == 0 {
            return 0.0;
        }
        (self.tokens_used_this_period as f64 / self.monthly_limit as f64) * 100.0
    }
}

/// Identifies one member's usage row for one calendar day
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationKey {
    pub tenant_id: String,
    pub member_id: String,
    pub date: NaiveDate,
}

impl AllocationKey {
    pub fn new(tenant_id: impl Into<String>, member_id: impl Into<String>, date: NaiveDate) -> Self {
        AllocationKey {
            tenant_id: tenant_id.into(),
            member_id: member_id.into(),
            date,
        }
    }
}

/// Daily usage row for a member within a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberAllocation {
    pub tenant_id: String,
    pub member_id: String,
    pub date: NaiveDate,
    /// Derived daily limit (`None` = unlimited)
    pub daily_limit: Option<u64>,
    pub tokens_used_today: u64,
    /// Member usage within the tenant's current period
    pub tokens_used_this_month: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl MemberAllocation {
    pub fn new(key: &AllocationKey) -> Self {
        MemberAllocation {
            tenant_id: key.tenant_id.clone(),
            member_id: key.member_id.clone(),
            date: key.date,
            daily_limit: None,
            tokens_used_today: 0,
            tokens_used_this_month: 0,
            last_used_at: None,
        }
    }

    pub fn key(&self) -> AllocationKey {
        AllocationKey::new(self.tenant_id.clone(), self.member_id.clone(), self.date)
    }

    /// Tokens left today (`None` = unlimited)
    pub fn remaining_today(&self) -> Option<u64> {
        self.daily_limit
            .map(|limit| limit.saturating_sub(self.tokens_used_today))
    }
}

/// Counter addressed by `atomic_adjust`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CounterTarget {
    /// `tokens_used_this_period` of a tenant pool
    TenantPeriod(String),
    /// `tokens_used_today` (and the mirrored monthly counter) of a member row
    MemberDaily(AllocationKey),
}

/// Adjustment rejected because it would breach the ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("insufficient budget: {current} used + {requested} requested exceeds {ceiling}")]
pub struct InsufficientBudget {
    pub current: u64,
    pub requested: u64,
    pub ceiling: u64,
}

impl InsufficientBudget {
    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.current)
    }
}

/// Failure of a ledger adjustment; the counter is left untouched
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdjustError {
    #[error(transparent)]
    InsufficientBudget(#[from] InsufficientBudget),

    #[error("unknown counter: {0:?}")]
    UnknownTarget(CounterTarget),
}
