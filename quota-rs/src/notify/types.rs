use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Budget a notification refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationScope {
    /// Tenant monthly pool
    Tenant,
    /// Member daily allocation
    Member,
}

/// Alert level; `Critical` is more severe than `Warning`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Threshold {
    Warning,
    Critical,
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Warning => write!(f, "warning"),
            Threshold::Critical => write!(f, "critical"),
        }
    }
}

/// Remaining-fraction cut-offs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NotificationThresholds {
    pub warning: f64,
    pub critical: f64,
}

impl Default for NotificationThresholds {
    fn default() -> Self {
        NotificationThresholds {
            warning: 0.25,
            critical: 0.10,
        }
    }
}

impl NotificationThresholds {
    /// Most severe threshold reached by `remaining_fraction`
    pub fn classify(&self, remaining_fraction: f64) -> Option<Threshold> {
        if remaining_fraction <= self.critical {
            Some(Threshold::Critical)
        } else if remaining_fraction <= self.warning {
            Some(Threshold::Warning)
        } else {
            None
        }
    }
}

/// Remaining fraction of a limit; over-draft clamps to 0.0
pub fn remaining_fraction(limit: u64, used: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    limit.saturating_sub(used) as f64 / limit as f64
}

/// Low-budget alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageNotification {
    pub tenant_id: String,
    /// Set for member-scope notifications
    pub member_id: Option<String>,
    pub scope: NotificationScope,
    pub threshold: Threshold,
    pub remaining_fraction: f64,
    pub remaining: u64,
    pub limit: u64,
    pub emitted_at: DateTime<Utc>,
}

impl UsageNotification {
    /// Human-readable summary
    pub fn message(&self) -> String {
        let percent = (self.remaining_fraction * 100.0).round();
        match (&self.scope, &self.member_id) {
            (NotificationScope::Member, Some(member_id)) => format!(
                "{}: member {} of tenant {} has {}% of today's allocation left ({} of {} tokens)",
                self.threshold, member_id, self.tenant_id, percent, self.remaining, self.limit
            ),
            _ => format!(
                "{}: tenant {} has {}% of its monthly pool left ({} of {} tokens)",
                self.threshold, self.tenant_id, percent, self.remaining, self.limit
            ),
        }
    }
}
