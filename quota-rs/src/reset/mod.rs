/// Budget reset sweeps
///
/// Daily and monthly rollovers are independent, externally triggered and
/// idempotent operations:
/// - Daily sweep ages out member rows past the retention window
/// - Monthly sweep clears each tenant's period counter on its anchor day
/// - Missed runs are detected and collapsed into a single reset

pub mod period;
pub mod scheduler;

pub use period::{current_period_start, next_period_start, periods_elapsed};
pub use scheduler::{DailySweepReport, MonthlySweepReport, ResetScheduler, TenantReset};
