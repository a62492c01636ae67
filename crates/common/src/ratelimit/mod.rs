//! Per-identity request quotas
//!
//! Each identity (client network address) gets two independent fixed
//! windows, one hour and one day long. A window starts with the first
//! admitted request after the previous window of the same kind expired.
//! Admission is serialized per identity so concurrent requests cannot both
//! take the last slot; denials never consume a slot.

mod store;

pub use store::{CounterStore, InMemoryCounterStore, JsonFileCounterStore, RedisCounterStore};

use crate::config::RateLimitConfig;
use crate::errors::Result;
use crate::metrics;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Quota window that denied a request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    Hour,
    Day,
}

impl QuotaScope {
    pub fn window(&self) -> Duration {
        match self {
            QuotaScope::Hour => Duration::hours(1),
            QuotaScope::Day => Duration::days(1),
        }
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Hour => write!(f, "hour"),
            QuotaScope::Day => write!(f, "day"),
        }
    }
}

/// Stored counters for one identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub hour_count: u32,
    pub hour_window_start: DateTime<Utc>,
    pub day_count: u32,
    pub day_window_start: DateTime<Utc>,
}

impl UsageRecord {
    /// Fresh record with both windows opening at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            hour_count: 0,
            hour_window_start: now,
            day_count: 0,
            day_window_start: now,
        }
    }

    pub fn hour_resets_at(&self) -> DateTime<Utc> {
        self.hour_window_start + QuotaScope::Hour.window()
    }

    pub fn day_resets_at(&self) -> DateTime<Utc> {
        self.day_window_start + QuotaScope::Day.window()
    }

    /// Reset every window whose boundary `now` has crossed
    fn roll(&mut self, now: DateTime<Utc>) {
        if now >= self.hour_resets_at() {
            self.hour_count = 0;
            self.hour_window_start = now;
        }
        if now >= self.day_resets_at() {
            self.day_count = 0;
            self.day_window_start = now;
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed {
        hour_remaining: u32,
        day_remaining: u32,
    },
    Denied {
        scope: QuotaScope,
        retry_after: std::time::Duration,
    },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Fixed-window rate limiter over a durable counter store
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    hourly_limit: u32,
    daily_limit: u32,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(store: Arc<dyn CounterStore>, hourly_limit: u32, daily_limit: u32) -> Self {
        Self {
            store,
            hourly_limit,
            daily_limit,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Create from configuration
    pub fn from_config(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self::new(store, config.hourly_limit, config.daily_limit)
    }

    /// Counter store backend name
    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    /// Check that the counter store is reachable
    pub async fn ping(&self) -> Result<()> {
        self.store.ping().await
    }

    fn identity_lock(&self, identity: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the identity's lock entry once no other admission holds it
    fn release_lock(&self, identity: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map and `lock` are the only owners left
        if Arc::strong_count(&lock) == 2 {
            locks.remove(identity);
        }
    }

    /// Number of identities with an admission in flight
    pub fn tracked_identities(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Admit or deny one request from `identity` at `now`
    ///
    /// Store failures propagate; they are the only fatal errors of the
    /// request path.
    pub async fn admit(&self, identity: &str, now: DateTime<Utc>) -> Result<Admission> {
        let lock = self.identity_lock(identity);
        let admission = {
            let _guard = lock.lock().await;
            self.admit_locked(identity, now).await
        };
        self.release_lock(identity, lock);
        admission
    }

    async fn admit_locked(&self, identity: &str, now: DateTime<Utc>) -> Result<Admission> {
        let mut record = self
            .store
            .get(identity)
            .await?
            .unwrap_or_else(|| UsageRecord::new(now));
        record.roll(now);

        let denied = if record.day_count >= self.daily_limit {
            Some((QuotaScope::Day, record.day_resets_at()))
        } else if record.hour_count >= self.hourly_limit {
            Some((QuotaScope::Hour, record.hour_resets_at()))
        } else {
            None
        };

        if let Some((scope, resets_at)) = denied {
            let retry_after = (resets_at - now).to_std().unwrap_or_default();
            info!(
                identity = %identity,
                scope = %scope,
                retry_after_secs = retry_after.as_secs(),
                "Request denied by quota"
            );
            metrics::record_admission(Some(scope));
            // Persist rolled windows so a reset is not recomputed forever
            self.store.put(identity, &record).await?;
            return Ok(Admission::Denied { scope, retry_after });
        }

        record.hour_count += 1;
        record.day_count += 1;
        self.store.put(identity, &record).await?;

        debug!(
            identity = %identity,
            hour_count = record.hour_count,
            day_count = record.day_count,
            "Request admitted"
        );
        metrics::record_admission(None);

        Ok(Admission::Allowed {
            hour_remaining: self.hourly_limit - record.hour_count,
            day_remaining: self.daily_limit - record.day_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn limiter(hourly: u32, daily: u32) -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryCounterStore::new()), hourly, daily)
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_eleventh_request_in_hour_is_denied() {
        let limiter = limiter(10, 25);
        let start = t0();

        for i in 0..10 {
            let admission = limiter
                .admit("1.2.3.4", start + Duration::minutes(i * 5))
                .await
                .unwrap();
            assert!(admission.is_allowed(), "request {} should be allowed", i + 1);
        }

        let eleventh = limiter
            .admit("1.2.3.4", start + Duration::minutes(55))
            .await
            .unwrap();
        match eleventh {
            Admission::Denied { scope, retry_after } => {
                assert_eq!(scope, QuotaScope::Hour);
                assert_eq!(retry_after, std::time::Duration::from_secs(5 * 60));
            }
            other => panic!("expected denial, got {:?}", other),
        }

        let after_rollover = limiter
            .admit("1.2.3.4", start + Duration::minutes(61))
            .await
            .unwrap();
        assert!(after_rollover.is_allowed());
    }

    #[tokio::test]
    async fn test_daily_ceiling_spans_hours() {
        let limiter = limiter(10, 25);
        let start = t0();
        let mut allowed = 0;

        for hour in 0..4 {
            for i in 0..10 {
                let now = start + Duration::hours(hour) + Duration::minutes(i);
                if limiter.admit("5.6.7.8", now).await.unwrap().is_allowed() {
                    allowed += 1;
                }
            }
        }
        assert_eq!(allowed, 25);

        let denied = limiter
            .admit("5.6.7.8", start + Duration::hours(5))
            .await
            .unwrap();
        match denied {
            Admission::Denied { scope, retry_after } => {
                assert_eq!(scope, QuotaScope::Day);
                assert_eq!(retry_after, std::time::Duration::from_secs(19 * 3600));
            }
            other => panic!("expected daily denial, got {:?}", other),
        }

        assert!(limiter
            .admit("5.6.7.8", start + Duration::days(1))
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_denial_does_not_consume_slot() {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::new(store.clone(), 1, 25);
        let now = t0();

        assert!(limiter.admit("ip", now).await.unwrap().is_allowed());
        for _ in 0..3 {
            assert!(!limiter.admit("ip", now).await.unwrap().is_allowed());
        }

        let record = store.get("ip").await.unwrap().unwrap();
        assert_eq!(record.hour_count, 1);
        assert_eq!(record.day_count, 1);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let limiter = limiter(1, 25);
        let now = t0();

        assert!(limiter.admit("a", now).await.unwrap().is_allowed());
        assert!(!limiter.admit("a", now).await.unwrap().is_allowed());
        assert!(limiter.admit("b", now).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_concurrent_admits_take_last_slot_once() {
        let limiter = Arc::new(limiter(5, 25));
        let now = t0();
        for _ in 0..4 {
            limiter.admit("9.9.9.9", now).await.unwrap();
        }

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.admit("9.9.9.9", now).await.unwrap() })
            })
            .collect();

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap().is_allowed() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[tokio::test]
    async fn test_lock_table_does_not_grow_with_identities() {
        let limiter = limiter(10, 25);
        let start = t0();

        for i in 0..1_000 {
            limiter.admit(&format!("10.0.{}.{}", i / 256, i % 256), start).await.unwrap();
        }
        assert_eq!(limiter.tracked_identities(), 0);

        let later = start + Duration::days(3);
        assert!(limiter.admit("10.0.0.1", later).await.unwrap().is_allowed());
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[tokio::test]
    async fn test_lock_table_drains_after_concurrent_admits() {
        let limiter = Arc::new(limiter(100, 200));
        let now = t0();

        let handles: Vec<_> = (0..64)
            .map(|i| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.admit(&format!("ip-{}", i % 4), now).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[tokio::test]
    async fn test_allowed_reports_remaining() {
        let limiter = limiter(10, 25);
        let admission = limiter.admit("1.1.1.1", t0()).await.unwrap();
        assert_eq!(
            admission,
            Admission::Allowed {
                hour_remaining: 9,
                day_remaining: 24
            }
        );
    }
}
