//! SQLite snapshot store
//!
//! Persists the ledger and open reservations so a restarted process picks
//! up where it left off. Snapshots are written whole, in one transaction.
//!
//! # Tables
//! ```text
//! tenant_pools        (tenant_id)                  one row per tenant
//! member_allocations  (tenant_id, member_id, date) one row per member day
//! reservations        (reservation_id)             open reservations, indexed on expires_at
//! ```

use crate::admission::Reservation;
use crate::error::{QuotaError, Result};
use crate::ledger::{LedgerSnapshot, MemberAllocation, TenantPool};
use crate::persistence::StoreSnapshot;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

type PoolRow = (String, i64, bool, i64, i64, String);
type AllocationRow = (String, String, String, Option<i64>, i64, i64, Option<String>);
type ReservationRow = (String, String, String, i64, String, String, String, String);

/// Snapshot store backed by SQLite
pub struct SqliteLedgerStore {
    db: SqlitePool,
}

impl SqliteLedgerStore {
    /// Open (creating if needed) the database at `database_url`
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let db = pool_options.connect_with(options).await?;

        let store = Self { db };
        store.init_db().await?;
        Ok(store)
    }

    /// Use an existing pool
    pub async fn from_pool(db: SqlitePool) -> Result<Self> {
        let store = Self { db };
        store.init_db().await?;
        Ok(store)
    }

    async fn init_db(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_pools (
                tenant_id TEXT PRIMARY KEY,
                monthly_limit INTEGER NOT NULL,
                unlimited INTEGER NOT NULL DEFAULT 0,
                tokens_used_this_period INTEGER NOT NULL DEFAULT 0,
                period_anchor_day INTEGER NOT NULL,
                last_reset_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS member_allocations (
                tenant_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                date TEXT NOT NULL,
                daily_limit INTEGER,
                tokens_used_today INTEGER NOT NULL DEFAULT 0,
                tokens_used_this_month INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT,
                PRIMARY KEY (tenant_id, member_id, date)
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reservations (
                reservation_id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                amount_reserved INTEGER NOT NULL,
                allocation_date TEXT NOT NULL,
                period_started_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.db)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_reservations_expires_at ON reservations(expires_at)")
            .execute(&self.db)
            .await?;

        Ok(())
    }

    /// Replace the stored state with `snapshot`
    pub async fn save_snapshot(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM tenant_pools").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM member_allocations").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM reservations").execute(&mut *tx).await?;

        for pool in &snapshot.ledger.pools {
            sqlx::query(
                r#"
                INSERT INTO tenant_pools (
                    tenant_id, monthly_limit, unlimited, tokens_used_this_period,
                    period_anchor_day, last_reset_at
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&pool.tenant_id)
            .bind(to_i64(pool.monthly_limit)?)
            .bind(pool.unlimited)
            .bind(to_i64(pool.tokens_used_this_period)?)
            .bind(i64::from(pool.period_anchor_day))
            .bind(pool.last_reset_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        for row in &snapshot.ledger.allocations {
            sqlx::query(
                r#"
                INSERT INTO member_allocations (
                    tenant_id, member_id, date, daily_limit,
                    tokens_used_today, tokens_used_this_month, last_used_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&row.tenant_id)
            .bind(&row.member_id)
            .bind(row.date.to_string())
            .bind(row.daily_limit.map(to_i64).transpose()?)
            .bind(to_i64(row.tokens_used_today)?)
            .bind(to_i64(row.tokens_used_this_month)?)
            .bind(row.last_used_at.map(|t| t.to_rfc3339()))
            .execute(&mut *tx)
            .await?;
        }

        for reservation in &snapshot.reservations {
            sqlx::query(
                r#"
                INSERT INTO reservations (
                    reservation_id, tenant_id, member_id, amount_reserved,
                    allocation_date, period_started_at, created_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(reservation.reservation_id.to_string())
            .bind(&reservation.tenant_id)
            .bind(&reservation.member_id)
            .bind(to_i64(reservation.amount_reserved)?)
            .bind(reservation.allocation_date.to_string())
            .bind(reservation.period_started_at.to_rfc3339())
            .bind(reservation.created_at.to_rfc3339())
            .bind(reservation.expires_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            "Saved snapshot: {} pools, {} allocation rows, {} open reservations",
            snapshot.ledger.pools.len(),
            snapshot.ledger.allocations.len(),
            snapshot.reservations.len()
        );
        Ok(())
    }

    /// Read the stored state
    pub async fn load_snapshot(&self) -> Result<StoreSnapshot> {
        let pool_rows = sqlx::query_as::<_, PoolRow>(
            r#"
            SELECT tenant_id, monthly_limit, unlimited, tokens_used_this_period,
                   period_anchor_day, last_reset_at
            FROM tenant_pools
            ORDER BY tenant_id
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let pools = pool_rows
            .into_iter()
            .map(|(tenant_id, limit, unlimited, used, anchor, last_reset_at)| {
                Ok(TenantPool {
                    tenant_id,
                    monthly_limit: to_u64(limit)?,
                    unlimited,
                    tokens_used_this_period: to_u64(used)?,
                    period_anchor_day: u32::try_from(anchor)
                        .map_err(|e| QuotaError::Storage(e.to_string()))?,
                    last_reset_at: parse_time(&last_reset_at)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let allocation_rows = sqlx::query_as::<_, AllocationRow>(
            r#"
            SELECT tenant_id, member_id, date, daily_limit,
                   tokens_used_today, tokens_used_this_month, last_used_at
            FROM member_allocations
            ORDER BY tenant_id, member_id, date
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let allocations = allocation_rows
            .into_iter()
            .map(|(tenant_id, member_id, date, daily_limit, today, month, last_used_at)| {
                Ok(MemberAllocation {
                    tenant_id,
                    member_id,
                    date: parse_date(&date)?,
                    daily_limit: daily_limit.map(to_u64).transpose()?,
                    tokens_used_today: to_u64(today)?,
                    tokens_used_this_month: to_u64(month)?,
                    last_used_at: last_used_at.as_deref().map(parse_time).transpose()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let reservations = self.fetch_reservations(None).await?;

        debug!(
            "Loaded snapshot: {} pools, {} allocation rows, {} reservations",
            pools.len(),
            allocations.len(),
            reservations.len()
        );

        Ok(StoreSnapshot {
            ledger: LedgerSnapshot { pools, allocations },
            reservations,
        })
    }

    /// Stored reservations expiring at or before `cutoff`
    pub async fn reservations_expiring_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Reservation>> {
        self.fetch_reservations(Some(cutoff)).await
    }

    async fn fetch_reservations(&self, cutoff: Option<DateTime<Utc>>) -> Result<Vec<Reservation>> {
        let rows = match cutoff {
            Some(cutoff) => {
                sqlx::query_as::<_, ReservationRow>(
                    r#"
                    SELECT reservation_id, tenant_id, member_id, amount_reserved,
                           allocation_date, period_started_at, created_at, expires_at
                    FROM reservations
                    WHERE expires_at <= ?
                    ORDER BY expires_at ASC
                    "#,
                )
                .bind(cutoff.to_rfc3339())
                .fetch_all(&self.db)
                .await?
            }
            None => {
                sqlx::query_as::<_, ReservationRow>(
                    r#"
                    SELECT reservation_id, tenant_id, member_id, amount_reserved,
                           allocation_date, period_started_at, created_at, expires_at
                    FROM reservations
                    ORDER BY expires_at ASC
                    "#,
                )
                .fetch_all(&self.db)
                .await?
            }
        };

        rows.into_iter()
            .map(|(id, tenant_id, member_id, amount, date, period, created, expires)| {
                Ok(Reservation {
                    reservation_id: Uuid::parse_str(&id)
                        .map_err(|e| QuotaError::Storage(e.to_string()))?,
                    tenant_id,
                    member_id,
                    amount_reserved: to_u64(amount)?,
                    allocation_date: parse_date(&date)?,
                    period_started_at: parse_time(&period)?,
                    created_at: parse_time(&created)?,
                    expires_at: parse_time(&expires)?,
                })
            })
            .collect()
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| QuotaError::Storage(format!("{} does not fit in INTEGER", value)))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| QuotaError::Storage(format!("negative counter {}", value)))
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QuotaError::Storage(e.to_string()))
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| QuotaError::Storage(e.to_string()))
}
