/// Member allocation derivation
///
/// This module turns a tenant pool, a member role and the number of
/// active members sharing that role into an effective token limit:
/// - Explicit role → multiplier table (`RoleLimitPolicy`)
/// - Pure daily/monthly limit calculators with floor division

pub mod calculator;
pub mod types;

pub use calculator::{compute_daily_limit, compute_monthly_limit, DAYS_PER_PERIOD};
pub use types::{QuotaMultiplier, Role, RoleLimitPolicy, RoleLimits};
