use crate::error::QuotaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tenant membership role, declared from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Member,
    Technician,
    Admin,
    Owner,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Viewer,
        Role::Member,
        Role::Technician,
        Role::Admin,
        Role::Owner,
    ];

    /// Position in the authorization hierarchy (viewer = 0)
    pub fn rank(self) -> u8 {
        self as u8
    }

    /// Check whether this role satisfies a minimum role requirement
    pub fn has_at_least(self, min: Role) -> bool {
        self >= min
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Member => "member",
            Role::Technician => "technician",
            Role::Admin => "admin",
            Role::Owner => "owner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = QuotaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Role::Viewer),
            "member" => Ok(Role::Member),
            "technician" => Ok(Role::Technician),
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            other => Err(QuotaError::Config(format!("Unknown role: {}", other))),
        }
    }
}

/// Share of a budget granted to a role
///
/// `Unlimited` and `Denied` are distinct states, not magic numbers:
/// unlimited members bypass member-level limits, denied members get a
/// limit of zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMultiplier {
    Unlimited,
    Denied,
    Fraction(f64),
}

impl QuotaMultiplier {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, QuotaMultiplier::Unlimited)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, QuotaMultiplier::Denied)
    }
}

/// Daily and monthly multipliers for one role
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoleLimits {
    pub daily: QuotaMultiplier,
    pub monthly: QuotaMultiplier,
}

impl RoleLimits {
    pub const fn uniform(multiplier: QuotaMultiplier) -> Self {
        RoleLimits {
            daily: multiplier,
            monthly: multiplier,
        }
    }
}

/// Role → multiplier table
///
/// One field per role so the table is total by construction. Quota
/// multipliers are independent of the role hierarchy: viewers rank
/// lowest and are denied, while technicians get a full share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleLimitPolicy {
    pub viewer: RoleLimits,
    pub member: RoleLimits,
    pub technician: RoleLimits,
    pub admin: RoleLimits,
    pub owner: RoleLimits,
}

impl Default for RoleLimitPolicy {
    fn default() -> Self {
        RoleLimitPolicy {
            viewer: RoleLimits::uniform(QuotaMultiplier::Denied),
            member: RoleLimits::uniform(QuotaMultiplier::Fraction(1.0)),
            technician: RoleLimits::uniform(QuotaMultiplier::Fraction(1.0)),
            admin: RoleLimits::uniform(QuotaMultiplier::Unlimited),
            owner: RoleLimits::uniform(QuotaMultiplier::Unlimited),
        }
    }
}

impl RoleLimitPolicy {
    /// Look up the multipliers for a role
    pub fn limits(&self, role: Role) -> RoleLimits {
        match role {
            Role::Viewer => self.viewer,
            Role::Member => self.member,
            Role::Technician => self.technician,
            Role::Admin => self.admin,
            Role::Owner => self.owner,
        }
    }

    /// Reject fractions that are not strictly positive finite numbers
    pub fn validate(&self) -> crate::error::Result<()> {
        for role in Role::ALL {
            let limits = self.limits(role);
            for (scope, multiplier) in [("daily", limits.daily), ("monthly", limits.monthly)] {
                if let QuotaMultiplier::Fraction(f) = multiplier {
                    if !f.is_finite() || f <= 0.0 {
                        return Err(QuotaError::Config(format!(
                            "Invalid {} multiplier {} for role {} (use \"denied\" for no access)",
                            scope, f, role
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
