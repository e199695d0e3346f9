/// Quota ledger
///
/// Durable accounting state for tenant pools and per-member daily rows.
/// Every counter lives behind its own lock, so adjustments for different
/// tenants or members never contend with each other. `atomic_adjust` is
/// the only mutation path for usage counters.

pub mod store;
pub mod types;

pub use store::{LedgerSnapshot, PeriodReset, QuotaLedger};
pub use types::{
    AdjustError, AllocationKey, CounterTarget, InsufficientBudget, MemberAllocation, TenantPool,
};
