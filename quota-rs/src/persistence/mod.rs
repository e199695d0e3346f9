/// Durable storage for engine state

pub mod sqlite;

use crate::admission::Reservation;
use crate::ledger::LedgerSnapshot;
use serde::{Deserialize, Serialize};

pub use sqlite::SqliteLedgerStore;

/// Ledger counters plus open reservations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub ledger: LedgerSnapshot,
    pub reservations: Vec<Reservation>,
}
