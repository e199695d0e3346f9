use crate::admission::types::{ReconcileOutcome, Reservation, TokenUsage};
use crate::error::{QuotaError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

const SHARDS: usize = 16;

#[derive(Debug, Clone)]
enum ReservationState {
    Open,
    Reconciled(ReconcileOutcome),
    Expired,
}

#[derive(Debug, Clone)]
struct Entry {
    reservation: Reservation,
    state: ReservationState,
    closed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Shard {
    entries: HashMap<Uuid, Entry>,
    /// Open reservations ordered by expiry
    by_expiry: BTreeSet<(DateTime<Utc>, Uuid)>,
}

/// Result of closing a reservation for reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// First close; the caller applies the correction
    Closed(Reservation, ReconcileOutcome),
    /// Already reconciled; carries the recorded outcome
    AlreadyReconciled(ReconcileOutcome),
}

/// Registry of reservations, sharded by id
///
/// Closed reservations are kept until purged so that repeated reconcile
/// calls observe the first outcome instead of applying twice.
pub struct ReservationBook {
    shards: Vec<RwLock<Shard>>,
}

impl Default for ReservationBook {
    fn default() -> Self {
        Self::new()
    }
}

impl ReservationBook {
    pub fn new() -> Self {
        ReservationBook {
            shards: (0..SHARDS).map(|_| RwLock::new(Shard::default())).collect(),
        }
    }

    fn shard(&self, id: &Uuid) -> &RwLock<Shard> {
        &self.shards[(id.as_u128() % SHARDS as u128) as usize]
    }

    /// Track a newly admitted reservation
    pub async fn insert(&self, reservation: Reservation) {
        let id = reservation.reservation_id;
        let mut shard = self.shard(&id).write().await;
        shard.by_expiry.insert((reservation.expires_at, id));
        shard.entries.insert(
            id,
            Entry {
                reservation,
                state: ReservationState::Open,
                closed_at: None,
            },
        );
    }

    /// Reservation by id, open or closed
    pub async fn get(&self, id: Uuid) -> Option<Reservation> {
        let shard = self.shard(&id).read().await;
        shard.entries.get(&id).map(|e| e.reservation.clone())
    }

    pub async fn is_open(&self, id: Uuid) -> bool {
        let shard = self.shard(&id).read().await;
        matches!(
            shard.entries.get(&id).map(|e| &e.state),
            Some(ReservationState::Open)
        )
    }

    /// Close a reservation with its actual usage
    ///
    /// The outcome is recorded under the shard lock before any ledger
    /// correction happens, so concurrent reconciles of the same id apply
    /// the correction exactly once. Unknown and expired ids yield
    /// `ReservationNotFound`.
    pub async fn close_reconciled(
        &self,
        id: Uuid,
        actual_amount: u64,
        usage: Option<TokenUsage>,
        now: DateTime<Utc>,
    ) -> Result<CloseOutcome> {
        let mut shard = self.shard(&id).write().await;
        let entry = shard
            .entries
            .get_mut(&id)
            .ok_or(QuotaError::ReservationNotFound(id))?;

        match &entry.state {
            ReservationState::Reconciled(outcome) => {
                return Ok(CloseOutcome::AlreadyReconciled(outcome.clone()))
            }
            ReservationState::Expired => return Err(QuotaError::ReservationNotFound(id)),
            ReservationState::Open => {}
        }

        let reservation = entry.reservation.clone();
        let outcome = ReconcileOutcome {
            reservation_id: id,
            tenant_id: reservation.tenant_id.clone(),
            member_id: reservation.member_id.clone(),
            amount_reserved: reservation.amount_reserved,
            actual_amount,
            delta: signed(actual_amount).saturating_sub(signed(reservation.amount_reserved)),
            usage,
            reconciled_at: now,
        };
        entry.state = ReservationState::Reconciled(outcome.clone());
        entry.closed_at = Some(now);
        shard.by_expiry.remove(&(reservation.expires_at, id));

        Ok(CloseOutcome::Closed(reservation, outcome))
    }

    /// Close and return every open reservation whose `expires_at` has passed
    pub async fn take_expired(&self, now: DateTime<Utc>) -> Vec<Reservation> {
        let mut expired = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().await;
            let due: Vec<_> = shard
                .by_expiry
                .iter()
                .take_while(|(expires_at, _)| *expires_at <= now)
                .copied()
                .collect();
            for key in due {
                shard.by_expiry.remove(&key);
                if let Some(entry) = shard.entries.get_mut(&key.1) {
                    entry.state = ReservationState::Expired;
                    entry.closed_at = Some(now);
                    expired.push(entry.reservation.clone());
                }
            }
        }
        expired.sort_by_key(|r| r.expires_at);
        expired
    }

    /// Forget closed reservations closed before `before`
    pub async fn purge_closed(&self, before: DateTime<Utc>) -> usize {
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.write().await;
            let len = shard.entries.len();
            shard
                .entries
                .retain(|_, e| e.closed_at.map_or(true, |closed| closed >= before));
            purged += len - shard.entries.len();
        }
        purged
    }

    /// Open reservations, oldest first
    pub async fn open_reservations(&self) -> Vec<Reservation> {
        let mut open = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().await;
            open.extend(
                shard
                    .entries
                    .values()
                    .filter(|e| matches!(e.state, ReservationState::Open))
                    .map(|e| e.reservation.clone()),
            );
        }
        open.sort_by_key(|r| r.created_at);
        open
    }

    /// Tokens held by open reservations of a tenant
    pub async fn open_reserved_total(&self, tenant_id: &str) -> u64 {
        self.open_reservations()
            .await
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.amount_reserved)
            .sum()
    }

    pub async fn open_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.read().await.by_expiry.len();
        }
        count
    }
}

pub(crate) fn signed(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}
