//! Per-tenant consumption rate over a sliding window

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Reconciled usage samples within the window
#[derive(Debug, Default)]
struct SlidingWindow {
    samples: VecDeque<(DateTime<Utc>, u64)>,
    total: u64,
}

impl SlidingWindow {
    fn add(&mut self, at: DateTime<Utc>, tokens: u64) {
        self.samples.push_back((at, tokens));
        self.total = self.total.saturating_add(tokens);
    }

    /// Remove samples older than the window
    fn cleanup(&mut self, cutoff: DateTime<Utc>) {
        while let Some(&(at, tokens)) = self.samples.front() {
            if at > cutoff {
                break;
            }
            self.samples.pop_front();
            self.total = self.total.saturating_sub(tokens);
        }
    }
}

/// Tracks how fast each tenant is consuming tokens
pub struct UsageRateTracker {
    window: Duration,
    windows: RwLock<HashMap<String, SlidingWindow>>,
}

impl UsageRateTracker {
    pub fn new(window: Duration) -> Self {
        UsageRateTracker {
            window,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Record `tokens` consumed by `tenant_id` at `at`
    pub async fn record(&self, tenant_id: &str, tokens: u64, at: DateTime<Utc>) {
        if tokens == 0 {
            return;
        }
        let mut windows = self.windows.write().await;
        let window = windows.entry(tenant_id.to_string()).or_default();
        window.cleanup(at - self.window);
        window.add(at, tokens);
    }

    /// Average tokens per minute over the window; 0.0 when nothing was seen
    pub async fn tokens_per_minute(&self, tenant_id: &str, now: DateTime<Utc>) -> f64 {
        let mut windows = self.windows.write().await;
        let Some(window) = windows.get_mut(tenant_id) else {
            return 0.0;
        };
        window.cleanup(now - self.window);
        let minutes = self.window.num_seconds() as f64 / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        window.total as f64 / minutes
    }

    /// Drop tenants with no samples left in the window
    pub async fn cleanup(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.write().await;
        let cutoff = now - self.window;
        windows.retain(|_, window| {
            window.cleanup(cutoff);
            !window.samples.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_rate_over_window() {
        let tracker = UsageRateTracker::new(Duration::minutes(10));
        let t0 = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();

        tracker.record("t1", 600, t0).await;
        tracker.record("t1", 400, t0 + Duration::minutes(5)).await;
        assert_eq!(tracker.tokens_per_minute("t1", t0 + Duration::minutes(6)).await, 100.0);

        // First sample slides out
        assert_eq!(tracker.tokens_per_minute("t1", t0 + Duration::minutes(11)).await, 40.0);
        assert_eq!(tracker.tokens_per_minute("t2", t0).await, 0.0);
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_tenants() {
        let tracker = UsageRateTracker::new(Duration::minutes(1));
        let t0 = Utc.with_ymd_and_hms(2024, 5, 2, 10, 0, 0).unwrap();
        tracker.record("t1", 10, t0).await;
        tracker.cleanup(t0 + Duration::minutes(2)).await;
        assert!(tracker.windows.read().await.is_empty());
    }
}
