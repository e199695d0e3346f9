use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Tenant not found: {0}")]
    TenantNotFound(String),

    #[error("Reservation not found: {0}")]
    ReservationNotFound(Uuid),

    #[error("Invalid period state for tenant {tenant_id}: {reason}")]
    InvalidPeriodState { tenant_id: String, reason: String },

    #[error("Queue ticket not found: {0}")]
    TicketNotFound(Uuid),

    #[error("Queue ticket expired: {0}")]
    TicketExpired(Uuid),

    #[error("Overflow queue full for tenant {0}")]
    QueueFull(String),

    #[error("Request for {requested} tokens can never be admitted for tenant {tenant_id} (limit {limit})")]
    Unadmittable {
        tenant_id: String,
        requested: u64,
        limit: u64,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QuotaError>;
