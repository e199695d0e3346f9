use crate::allocation::Role;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Caller-supplied identity and estimate for one metered operation
///
/// The engine performs no membership lookups: role and the number of
/// active members sharing it come from the caller's identity layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub tenant_id: String,
    pub member_id: String,
    pub role: Role,
    #[serde(default = "default_active_members")]
    pub active_members_in_role: u32,
    pub estimated_tokens: u64,
}

fn default_active_members() -> u32 {
    1
}

impl AdmissionRequest {
    pub fn new(
        tenant_id: impl Into<String>,
        member_id: impl Into<String>,
        role: Role,
        estimated_tokens: u64,
    ) -> Self {
        AdmissionRequest {
            tenant_id: tenant_id.into(),
            member_id: member_id.into(),
            role,
            active_members_in_role: 1,
            estimated_tokens,
        }
    }

    pub fn with_active_members(mut self, active_members_in_role: u32) -> Self {
        self.active_members_in_role = active_members_in_role;
        self
    }
}

/// In-flight hold on tenant and member budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub tenant_id: String,
    pub member_id: String,
    pub amount_reserved: u64,
    /// Day row the reserved amount was charged to
    pub allocation_date: NaiveDate,
    /// Tenant period the reserved amount was charged to
    pub period_started_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Metered usage split into prompt and completion tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        TokenUsage {
            input_tokens,
            output_tokens,
        }
    }

    /// Amount charged against the budget
    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Result of closing a reservation with its actual usage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileOutcome {
    pub reservation_id: Uuid,
    pub tenant_id: String,
    pub member_id: String,
    pub amount_reserved: u64,
    pub actual_amount: u64,
    /// `actual_amount - amount_reserved`
    pub delta: i64,
    /// Input/output split, when the caller reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub reconciled_at: DateTime<Utc>,
}

/// Remaining budget at the moment of an admission decision
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tenant_id: String,
    pub member_id: String,
    /// `None` = unlimited
    pub tenant_limit: Option<u64>,
    pub tenant_used: u64,
    pub tenant_remaining: Option<u64>,
    pub member_daily_limit: Option<u64>,
    pub member_used_today: u64,
    pub member_remaining_today: Option<u64>,
}

/// Why an admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    TenantBudgetExhausted,
    MemberDailyLimitExhausted,
    /// Lost a race against a concurrent reservation; safe to retry
    ConcurrentReservationLost,
    UnknownTenant,
}

impl DenialReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DenialReason::ConcurrentReservationLost)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::TenantBudgetExhausted => "tenant_budget_exhausted",
            DenialReason::MemberDailyLimitExhausted => "member_daily_limit_exhausted",
            DenialReason::ConcurrentReservationLost => "concurrent_reservation_lost",
            DenialReason::UnknownTenant => "unknown_tenant",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission refusal, returned as a value with the budget snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("admission denied for {}/{}: {reason}", .snapshot.tenant_id, .snapshot.member_id)]
pub struct AdmissionDenied {
    pub reason: DenialReason,
    pub snapshot: BudgetSnapshot,
}

impl AdmissionDenied {
    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }
}

/// Dry-run admission verdict; nothing is reserved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCheck {
    pub allowed: bool,
    pub tenant_ok: bool,
    pub member_ok: bool,
    pub reason: Option<DenialReason>,
    pub snapshot: BudgetSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_lost_races_are_retryable() {
        assert!(DenialReason::ConcurrentReservationLost.is_retryable());
        assert!(!DenialReason::TenantBudgetExhausted.is_retryable());
        assert!(!DenialReason::MemberDailyLimitExhausted.is_retryable());
        assert!(!DenialReason::UnknownTenant.is_retryable());
    }

    #[test]
    fn test_denied_message() {
        let denied = AdmissionDenied {
            reason: DenialReason::TenantBudgetExhausted,
            snapshot: BudgetSnapshot {
                tenant_id: "t1".into(),
                member_id: "m1".into(),
                ..Default::default()
            },
        };
        assert_eq!(
            denied.to_string(),
            "admission denied for t1/m1: tenant_budget_exhausted"
        );
    }

    #[test]
    fn test_request_defaults_active_members() {
        let request: AdmissionRequest = serde_json::from_str(
            r#"{"tenant_id":"t1","member_id":"m1","role":"technician","estimated_tokens":40}"#,
        )
        .unwrap();
        assert_eq!(request.active_members_in_role, 1);
        assert_eq!(request.role, Role::Technician);
    }
}
