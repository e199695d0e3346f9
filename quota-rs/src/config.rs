//! Configuration for quota-rs

use crate::allocation::RoleLimitPolicy;
use crate::error::{QuotaError, Result};
use crate::notify::NotificationThresholds;
use crate::overflow::QueueSettings;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub notifications: NotificationConfig,
    pub overflow: OverflowConfig,
    pub roles: RoleLimitPolicy,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    /// Pools registered at startup when absent
    pub tenants: Vec<TenantSeed>,
}

/// Reservation and retention settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lifetime of an unreconciled reservation
    pub reservation_timeout_secs: u64,
    /// Days of member rows kept by the daily sweep
    pub allocation_retention_days: u32,
    /// How long closed reservations answer repeated reconciles
    pub closed_reservation_retention_secs: u64,
    /// Attempts made by `reserve_with_retry`
    pub max_admission_attempts: u32,
    /// Upper bound of the random pause between attempts
    pub retry_jitter_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_timeout_secs: 300,
            allocation_retention_days: 90,
            closed_reservation_retention_secs: 3600,
            max_admission_attempts: 3,
            retry_jitter_ms: 25,
        }
    }
}

impl EngineConfig {
    pub fn reservation_timeout(&self) -> Duration {
        seconds(self.reservation_timeout_secs)
    }

    pub fn closed_reservation_retention(&self) -> Duration {
        seconds(self.closed_reservation_retention_secs)
    }
}

/// Remaining-fraction thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub warning_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 0.25,
            critical_threshold: 0.10,
        }
    }
}

impl NotificationConfig {
    pub fn thresholds(&self) -> NotificationThresholds {
        NotificationThresholds {
            warning: self.warning_threshold,
            critical: self.critical_threshold,
        }
    }
}

/// Overflow queue settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OverflowConfig {
    pub max_queue_age_secs: u64,
    pub max_queue_depth: usize,
    pub fallback_wait_per_request_secs: u64,
    /// Window of the drain-rate tracker
    pub drain_rate_window_secs: u64,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            max_queue_age_secs: 3600,
            max_queue_depth: 1000,
            fallback_wait_per_request_secs: 30,
            drain_rate_window_secs: 900,
        }
    }
}

impl OverflowConfig {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_age: seconds(self.max_queue_age_secs),
            max_depth: self.max_queue_depth,
            fallback_wait_per_request: seconds(self.fallback_wait_per_request_secs),
        }
    }

    pub fn drain_rate_window(&self) -> Duration {
        seconds(self.drain_rate_window_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://quota.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8088".to_string(),
        }
    }
}

/// Intervals of the maintenance task started by `serve`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub expiry_interval_secs: u64,
    pub reset_interval_secs: u64,
    pub persist_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_interval_secs: 60,
            reset_interval_secs: 3600,
            persist_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Tenant pool declared in configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenantSeed {
    pub tenant_id: String,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u64,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default = "default_anchor_day")]
    pub period_anchor_day: u32,
}

fn default_monthly_limit() -> u64 {
    100_000
}

fn default_anchor_day() -> u32 {
    1
}

fn seconds(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| QuotaError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| QuotaError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, then the optional file, then `QUOTA__SECTION__KEY`
    /// environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder().add_source(
            ::config::Config::try_from(&Config::default())
                .map_err(|e| QuotaError::Config(e.to_string()))?,
        );

        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("QUOTA")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| QuotaError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.reservation_timeout_secs == 0 {
            return Err(QuotaError::Config(
                "engine.reservation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.engine.allocation_retention_days == 0 {
            return Err(QuotaError::Config(
                "engine.allocation_retention_days must be positive".to_string(),
            ));
        }
        if self.engine.max_admission_attempts == 0 {
            return Err(QuotaError::Config(
                "engine.max_admission_attempts must be at least 1".to_string(),
            ));
        }

        let warning = self.notifications.warning_threshold;
        let critical = self.notifications.critical_threshold;
        if !(0.0 < critical && critical < warning && warning < 1.0) {
            return Err(QuotaError::Config(format!(
                "Thresholds must satisfy 0 < critical < warning < 1, got critical={} warning={}",
                critical, warning
            )));
        }

        if self.overflow.max_queue_age_secs == 0 || self.overflow.max_queue_depth == 0 {
            return Err(QuotaError::Config(
                "overflow.max_queue_age_secs and overflow.max_queue_depth must be positive"
                    .to_string(),
            ));
        }
        if self.overflow.drain_rate_window_secs == 0 {
            return Err(QuotaError::Config(
                "overflow.drain_rate_window_secs must be positive".to_string(),
            ));
        }

        if self.scheduler.expiry_interval_secs == 0
            || self.scheduler.reset_interval_secs == 0
            || self.scheduler.persist_interval_secs == 0
        {
            return Err(QuotaError::Config(
                "scheduler intervals must be positive".to_string(),
            ));
        }

        self.roles.validate()?;

        for tenant in &self.tenants {
            if !(1..=28).contains(&tenant.period_anchor_day) {
                return Err(QuotaError::Config(format!(
                    "Tenant {}: period_anchor_day must be within 1-28, got {}",
                    tenant.tenant_id, tenant.period_anchor_day
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{QuotaMultiplier, Role};
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.engine.reservation_timeout(), Duration::minutes(5));
        assert_eq!(config.overflow.queue_settings().max_depth, 1000);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine]
reservation_timeout_secs = 120

[roles.member]
daily = {{ fraction = 0.5 }}
monthly = "unlimited"

[[tenants]]
tenant_id = "acme"
monthly_limit = 50000
period_anchor_day = 15
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.reservation_timeout_secs, 120);
        assert_eq!(config.engine.allocation_retention_days, 90);
        assert_eq!(config.roles.limits(Role::Member).daily, QuotaMultiplier::Fraction(0.5));
        assert_eq!(config.roles.limits(Role::Member).monthly, QuotaMultiplier::Unlimited);
        assert_eq!(config.tenants.len(), 1);
        assert_eq!(config.tenants[0].period_anchor_day, 15);
        assert!(!config.tenants[0].unlimited);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.notifications.critical_threshold = 0.3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tenants.push(TenantSeed {
            tenant_id: "t1".into(),
            monthly_limit: 10,
            unlimited: false,
            period_anchor_day: 31,
        });
        assert!(matches!(config.validate(), Err(QuotaError::Config(_))));

        let mut config = Config::default();
        config.engine.reservation_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.api.listen_addr, "127.0.0.1:8088");
        assert_eq!(config.scheduler.expiry_interval_secs, 60);
    }
}
