//! quota-rs: Hierarchical token-quota accounting
//!
//! Gates expensive metered operations (AI inference calls) behind
//! multi-level token budgets and keeps concurrent callers from spending
//! tokens that do not exist.
//!
//! # Features
//!
//! - **Tenant pools**: monthly budgets shared by every member of a tenant
//! - **Member allocations**: daily limits derived from role and fair division
//! - **Reservations**: atomic check-then-reserve, reconciled with actual usage
//! - **Resets**: independent daily and monthly rollovers, safe to re-run
//! - **Notifications**: warning and critical thresholds, once per period
//! - **Overflow queue**: FIFO waiting line for requests denied on budget
//!
//! # Example
//!
//! ```no_run
//! use quota_rs::admission::AdmissionRequest;
//! use quota_rs::allocation::Role;
//! use quota_rs::clock::SystemClock;
//! use quota_rs::config::Config;
//! use quota_rs::engine::QuotaEngine;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = QuotaEngine::new(&Config::default(), Arc::new(SystemClock));
//!     engine.register_tenant("acme", 100_000, 1).await?;
//!
//!     let request = AdmissionRequest::new("acme", "alice", Role::Technician, 1_200);
//!     let reservation = engine.check_and_reserve(&request).await?;
//!
//!     // ... run the metered operation ...
//!
//!     engine.reconcile(reservation.reservation_id, 1_050).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`ledger`]: Tenant pools, member rows and the atomic adjustment primitive
//! - [`allocation`]: Roles and member limit derivation
//! - [`admission`]: Check-then-reserve admission control
//! - [`usage`]: Reconciliation and reservation expiry
//! - [`reset`]: Daily and monthly sweeps
//! - [`notify`]: Threshold notifications and delivery sinks
//! - [`overflow`]: Queue for requests waiting on budget
//! - [`engine`]: Facade tying the components together
//! - [`persistence`]: SQLite snapshots
//! - [`api`]: HTTP endpoints

pub mod admission;
pub mod allocation;
pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod notify;
pub mod overflow;
pub mod persistence;
pub mod reset;
pub mod usage;

pub use engine::QuotaEngine;
pub use error::{QuotaError, Result};
