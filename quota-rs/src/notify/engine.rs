use crate::clock::Clock;
use crate::ledger::{AllocationKey, QuotaLedger};
use crate::notify::sink::NotificationSink;
use crate::notify::types::{
    remaining_fraction, NotificationScope, NotificationThresholds, Threshold, UsageNotification,
};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Budget window an emission belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Window {
    /// Tenant period, identified by its start
    Period(DateTime<Utc>),
    /// Member day
    Day(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EmissionKey {
    tenant_id: String,
    member_id: Option<String>,
    window: Window,
}

/// Emits threshold crossings, each at most once per budget window
///
/// Emission state is keyed by the window (tenant period start or member
/// day), so a rollover starts with a clean slate without any explicit
/// reset.
pub struct NotificationEngine {
    ledger: Arc<QuotaLedger>,
    clock: Arc<dyn Clock>,
    thresholds: NotificationThresholds,
    emitted: RwLock<HashMap<EmissionKey, Threshold>>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationEngine {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        clock: Arc<dyn Clock>,
        thresholds: NotificationThresholds,
    ) -> Self {
        NotificationEngine {
            ledger,
            clock,
            thresholds,
            emitted: RwLock::new(HashMap::new()),
            sinks: Vec::new(),
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn thresholds(&self) -> NotificationThresholds {
        self.thresholds
    }

    /// Check the tenant pool and, when given, the member's day against the
    /// thresholds; deliver and return whatever is newly crossed
    pub async fn evaluate(&self, tenant_id: &str, member_id: Option<&str>) -> Vec<UsageNotification> {
        let now = self.clock.now();
        let mut notifications = Vec::new();

        if let Ok(pool) = self.ledger.get_pool(tenant_id).await {
            if let Some(limit) = pool.ceiling() {
                let key = EmissionKey {
                    tenant_id: tenant_id.to_string(),
                    member_id: None,
                    window: Window::Period(pool.last_reset_at),
                };
                if let Some(n) = self
                    .observe(key, NotificationScope::Tenant, limit, pool.tokens_used_this_period, now)
                    .await
                {
                    notifications.push(n);
                }
            }
        }

        if let Some(member_id) = member_id {
            let today = now.date_naive();
            let row_key = AllocationKey::new(tenant_id, member_id, today);
            if let Some(row) = self.ledger.find_allocation(&row_key).await {
                if let Some(limit) = row.daily_limit {
                    let key = EmissionKey {
                        tenant_id: tenant_id.to_string(),
                        member_id: Some(member_id.to_string()),
                        window: Window::Day(today),
                    };
                    if let Some(n) = self
                        .observe(key, NotificationScope::Member, limit, row.tokens_used_today, now)
                        .await
                    {
                        notifications.push(n);
                    }
                }
            }
        }

        for notification in &notifications {
            for sink in &self.sinks {
                sink.deliver(notification);
            }
        }

        notifications
    }

    async fn observe(
        &self,
        key: EmissionKey,
        scope: NotificationScope,
        limit: u64,
        used: u64,
        now: DateTime<Utc>,
    ) -> Option<UsageNotification> {
        if limit == 0 {
            return None;
        }
        let fraction = remaining_fraction(limit, used);
        let level = self.thresholds.classify(fraction)?;

        let mut emitted = self.emitted.write().await;
        if emitted.get(&key).is_some_and(|previous| *previous >= level) {
            return None;
        }
        emitted.insert(key.clone(), level);

        Some(UsageNotification {
            tenant_id: key.tenant_id,
            member_id: key.member_id,
            scope,
            threshold: level,
            remaining_fraction: fraction,
            remaining: limit.saturating_sub(used),
            limit,
            emitted_at: now,
        })
    }

    /// Mark thresholds already crossed in the ledger as emitted, without
    /// delivering anything; returns how many windows were marked
    ///
    /// Run after loading a stored ledger so a restart does not repeat
    /// notifications for the windows still open.
    pub async fn prime(&self) -> usize {
        let now = self.clock.now();
        let today = now.date_naive();
        let mut marked = 0;

        for tenant_id in self.ledger.tenant_ids().await {
            let Ok(pool) = self.ledger.get_pool(&tenant_id).await else {
                continue;
            };
            if let Some(limit) = pool.ceiling() {
                let key = EmissionKey {
                    tenant_id: tenant_id.clone(),
                    member_id: None,
                    window: Window::Period(pool.last_reset_at),
                };
                if self
                    .observe(key, NotificationScope::Tenant, limit, pool.tokens_used_this_period, now)
                    .await
                    .is_some()
                {
                    marked += 1;
                }
            }

            for row in self.ledger.allocations_for(&tenant_id).await {
                let Some(limit) = row.daily_limit.filter(|_| row.date == today) else {
                    continue;
                };
                let key = EmissionKey {
                    tenant_id: tenant_id.clone(),
                    member_id: Some(row.member_id.clone()),
                    window: Window::Day(today),
                };
                if self
                    .observe(key, NotificationScope::Member, limit, row.tokens_used_today, now)
                    .await
                    .is_some()
                {
                    marked += 1;
                }
            }
        }

        if marked > 0 {
            debug!("Primed {} notification windows from the ledger", marked);
        }
        marked
    }

    /// Forget emission state of closed windows; returns how many entries
    /// were dropped
    pub async fn prune(&self) -> usize {
        let today = self.clock.today();
        let mut current_periods = HashMap::new();
        for tenant_id in self.ledger.tenant_ids().await {
            if let Ok(pool) = self.ledger.get_pool(&tenant_id).await {
                current_periods.insert(tenant_id, pool.last_reset_at);
            }
        }

        let mut emitted = self.emitted.write().await;
        let before = emitted.len();
        emitted.retain(|key, _| match key.window {
            Window::Day(date) => date == today,
            Window::Period(start) => current_periods.get(&key.tenant_id) == Some(&start),
        });
        let pruned = before - emitted.len();
        if pruned > 0 {
            debug!("Pruned {} notification emission entries", pruned);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::CounterTarget;
    use crate::notify::sink::MockNotificationSink;
    use chrono::{Duration, TimeZone};

    async fn setup() -> (Arc<ManualClock>, Arc<QuotaLedger>, NotificationEngine) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(QuotaLedger::new(clock.clone()));
        ledger.upsert_pool("t1", 1000, false, 1).await.unwrap();
        let engine = NotificationEngine::new(
            ledger.clone(),
            clock.clone(),
            NotificationThresholds::default(),
        );
        (clock, ledger, engine)
    }

    async fn spend(ledger: &QuotaLedger, tokens: i64) {
        ledger
            .atomic_adjust(&CounterTarget::TenantPeriod("t1".into()), tokens, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_each_threshold_emitted_once() {
        let (_clock, ledger, engine) = setup().await;

        spend(&ledger, 700).await;
        assert!(engine.evaluate("t1", None).await.is_empty());

        spend(&ledger, 60).await; // 24% left
        let first = engine.evaluate("t1", None).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].threshold, Threshold::Warning);
        assert_eq!(first[0].remaining, 240);

        spend(&ledger, 10).await;
        assert!(engine.evaluate("t1", None).await.is_empty());

        spend(&ledger, 200).await; // 3% left
        let critical = engine.evaluate("t1", None).await;
        assert_eq!(critical[0].threshold, Threshold::Critical);

        // Refund back above warning does not re-arm within the period
        spend(&ledger, -500).await;
        assert!(engine.evaluate("t1", None).await.is_empty());
        spend(&ledger, 400).await;
        assert!(engine.evaluate("t1", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_jump_straight_to_critical_emits_only_critical() {
        let (_clock, ledger, engine) = setup().await;
        spend(&ledger, 950).await;
        let emitted = engine.evaluate("t1", None).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].threshold, Threshold::Critical);
    }

    #[tokio::test]
    async fn test_rollover_rearms() {
        let (clock, ledger, engine) = setup().await;
        spend(&ledger, 800).await;
        assert_eq!(engine.evaluate("t1", None).await.len(), 1);

        clock.set(Utc.with_ymd_and_hms(2024, 6, 1, 0, 1, 0).unwrap());
        let period_start = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        ledger
            .reset_period_if_due("t1", period_start, clock.now())
            .await
            .unwrap();
        assert_eq!(engine.prune().await, 1);

        spend(&ledger, 800).await;
        assert_eq!(engine.evaluate("t1", None).await.len(), 1);
    }

    #[tokio::test]
    async fn test_member_scope_and_sink_delivery() {
        let (clock, ledger, mut engine) = setup().await;
        let mut sink = MockNotificationSink::new();
        sink.expect_deliver()
            .withf(|n| n.scope == NotificationScope::Member && n.member_id.as_deref() == Some("m1"))
            .times(1)
            .return_const(());
        engine.add_sink(Arc::new(sink));

        let row = ledger
            .get_or_create_allocation("t1", "m1", clock.today())
            .await
            .unwrap();
        ledger.set_daily_limit(&row.key(), Some(100)).await.unwrap();
        ledger
            .atomic_adjust(&CounterTarget::MemberDaily(row.key()), 92, Some(100))
            .await
            .unwrap();

        let emitted = engine.evaluate("t1", Some("m1")).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].threshold, Threshold::Critical);

        // Next day is a new window
        clock.advance(Duration::days(1));
        assert!(engine.evaluate("t1", Some("m1")).await.is_empty());
    }

    #[tokio::test]
    async fn test_prime_marks_crossed_windows_without_delivery() {
        let (clock, ledger, mut engine) = setup().await;
        let mut sink = MockNotificationSink::new();
        sink.expect_deliver()
            .withf(|n| n.threshold == Threshold::Critical)
            .times(1)
            .return_const(());
        engine.add_sink(Arc::new(sink));

        spend(&ledger, 800).await;
        let row = ledger
            .get_or_create_allocation("t1", "m1", clock.today())
            .await
            .unwrap();
        ledger.set_daily_limit(&row.key(), Some(100)).await.unwrap();
        ledger
            .atomic_adjust(&CounterTarget::MemberDaily(row.key()), 80, Some(100))
            .await
            .unwrap();

        assert_eq!(engine.prime().await, 2);
        assert!(engine.evaluate("t1", Some("m1")).await.is_empty());

        // A further crossing is still reported
        spend(&ledger, 150).await;
        let emitted = engine.evaluate("t1", None).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].threshold, Threshold::Critical);
    }

    #[tokio::test]
    async fn test_unlimited_and_zero_limits_are_skipped() {
        let (_clock, ledger, engine) = setup().await;
        ledger.upsert_pool("t1", 0, true, 1).await.unwrap();
        spend(&ledger, 10_000).await;
        assert!(engine.evaluate("t1", None).await.is_empty());

        ledger.upsert_pool("t1", 0, false, 1).await.unwrap();
        assert!(engine.evaluate("t1", None).await.is_empty());
    }
}
