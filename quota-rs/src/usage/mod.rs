/// Usage reconciliation
///
/// Closes reservations with the amount actually consumed and feeds the
/// per-tenant drain rate used for overflow wait estimates.

pub mod rate;
pub mod recorder;

pub use crate::admission::ReconcileOutcome;
pub use rate::UsageRateTracker;
pub use recorder::{ExpirySweep, UsageRecorder};
