//! Member limit derivation
//!
//! Pure functions: given a pool snapshot, a role multiplier and the number
//! of active members sharing that role, produce the member's limit.
//! Rounding always goes down, so the shares of `n` members never sum to
//! more than the role's slice; the remainder stays in the tenant pool.

use crate::allocation::types::{QuotaMultiplier, Role, RoleLimitPolicy};
use crate::ledger::TenantPool;

/// Days a monthly pool is spread over when deriving a daily budget
pub const DAYS_PER_PERIOD: u64 = 30;

/// Daily token limit for one member (`None` = unlimited)
pub fn compute_daily_limit(
    pool: &TenantPool,
    multiplier: QuotaMultiplier,
    active_members_in_role: u32,
) -> Option<u64> {
    divide_share(
        pool,
        pool.monthly_limit / DAYS_PER_PERIOD,
        multiplier,
        active_members_in_role,
    )
}

/// Monthly token limit for one member (`None` = unlimited)
pub fn compute_monthly_limit(
    pool: &TenantPool,
    multiplier: QuotaMultiplier,
    active_members_in_role: u32,
) -> Option<u64> {
    divide_share(pool, pool.monthly_limit, multiplier, active_members_in_role)
}

fn divide_share(
    pool: &TenantPool,
    budget: u64,
    multiplier: QuotaMultiplier,
    active_members_in_role: u32,
) -> Option<u64> {
    match multiplier {
        QuotaMultiplier::Unlimited => None,
        QuotaMultiplier::Denied => Some(0),
        QuotaMultiplier::Fraction(_) if pool.unlimited => None,
        QuotaMultiplier::Fraction(_) if active_members_in_role == 0 => Some(budget),
        QuotaMultiplier::Fraction(fraction) => {
            let share = budget as f64 * fraction / active_members_in_role as f64;
            Some(share.floor() as u64)
        }
    }
}

impl RoleLimitPolicy {
    /// Daily limit for a member holding `role`
    pub fn daily_limit(&self, pool: &TenantPool, role: Role, active_members_in_role: u32) -> Option<u64> {
        compute_daily_limit(pool, self.limits(role).daily, active_members_in_role)
    }

    /// Monthly limit for a member holding `role`
    pub fn monthly_limit(&self, pool: &TenantPool, role: Role, active_members_in_role: u32) -> Option<u64> {
        compute_monthly_limit(pool, self.limits(role).monthly, active_members_in_role)
    }
}
