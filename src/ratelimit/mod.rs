//! Request rate limiting behind one backend interface.
//!
//! Three backends: an in-process fixed window with LRU eviction, a
//! database-backed sliding window, and a Redis-like secondary storage
//! reached through a trait so no client crate is pinned.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::{dialect, Store};

const MEMORY_MAX_KEYS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub limit: u64,
}

impl RateLimitDecision {
    pub fn retry_after_secs(&self) -> i64 {
        (self.reset_at - Utc::now()).num_seconds().max(0)
    }
}

#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Inspect the current window without spending a unit.
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision>;
    /// Spend one unit if the window has room.
    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision>;
    async fn reset(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------
// Memory backend: fixed window per key.
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct WindowBucket {
    window_start: DateTime<Utc>,
    count: u64,
    last_seen: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryRateLimiter {
    buckets: Mutex<HashMap<String, WindowBucket>>,
}

impl MemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn decide(bucket: &WindowBucket, limit: u64, window: Duration) -> RateLimitDecision {
        RateLimitDecision {
            allowed: bucket.count <= limit,
            remaining: limit.saturating_sub(bucket.count),
            reset_at: bucket.window_start + window,
            limit,
        }
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryRateLimiter {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let buckets = self.buckets.lock().await;
        let now = Utc::now();
        match buckets.get(key) {
            Some(bucket) if now < bucket.window_start + window => {
                let mut decision = Self::decide(bucket, limit, window);
                decision.allowed = bucket.count < limit;
                Ok(decision)
            }
            _ => Ok(RateLimitDecision {
                allowed: limit > 0,
                remaining: limit,
                reset_at: now + window,
                limit,
            }),
        }
    }

    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let mut buckets = self.buckets.lock().await;
        let now = Utc::now();

        let bucket = match buckets.get_mut(key) {
            Some(bucket) if now < bucket.window_start + window => {
                bucket.count += 1;
                bucket.last_seen = now;
                bucket.clone()
            }
            _ => {
                let fresh = WindowBucket {
                    window_start: now,
                    count: 1,
                    last_seen: now,
                };
                buckets.insert(key.to_string(), fresh.clone());
                fresh
            }
        };

        // Keep the table bounded: drop the least recently seen keys.
        if buckets.len() > MEMORY_MAX_KEYS {
            let mut by_age: Vec<(String, DateTime<Utc>)> = buckets
                .iter()
                .map(|(k, b)| (k.clone(), b.last_seen))
                .collect();
            by_age.sort_by_key(|(_, seen)| *seen);
            for (stale, _) in by_age.iter().take(buckets.len() - MEMORY_MAX_KEYS) {
                buckets.remove(stale);
            }
        }

        Ok(Self::decide(&bucket, limit, window))
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.buckets.lock().await.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Database backend: sliding window over rate_limit_log.
// ---------------------------------------------------------------------

pub struct DatabaseRateLimiter {
    store: Store,
}

impl DatabaseRateLimiter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn window_count(&self, key: &str, window: Duration) -> Result<i64> {
        let table = self.store.table("rate_limit_log");
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT {} FROM {table} WHERE key = $1 AND created_at >= {} - {}",
            dialect::count_as_int("*"),
            dialect::now(),
            dialect::interval_secs(window.num_seconds())
        ))
        .bind(key)
        .fetch_one(self.store.pool())
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl RateLimiterBackend for DatabaseRateLimiter {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let count = self.window_count(key, window).await? as u64;
        Ok(RateLimitDecision {
            allowed: count < limit,
            remaining: limit.saturating_sub(count),
            reset_at: Utc::now() + window,
            limit,
        })
    }

    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let table = self.store.table("rate_limit_log");
        let mut tx = self.store.begin().await?;
        // Lock the window's rows so two racing consumers observe each
        // other's inserts.
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT {} FROM ( \
                 SELECT 1 FROM {table} \
                 WHERE key = $1 AND created_at >= {} - {} \
                 FOR UPDATE \
             ) window_rows",
            dialect::count_as_int("*"),
            dialect::now(),
            dialect::interval_secs(window.num_seconds())
        ))
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let count = count as u64;
        if count >= limit {
            tx.rollback().await?;
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at: Utc::now() + window,
                limit,
            });
        }

        sqlx::query(&format!("INSERT INTO {table} (key) VALUES ($1)"))
            .bind(key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(RateLimitDecision {
            allowed: true,
            remaining: limit.saturating_sub(count + 1),
            reset_at: Utc::now() + window,
            limit,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let table = self.store.table("rate_limit_log");
        sqlx::query(&format!("DELETE FROM {table} WHERE key = $1"))
            .bind(key)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Secondary storage backend (Redis-like), behind a trait.
// ---------------------------------------------------------------------

/// The minimal key-value surface the secondary backend needs. An external
/// store implements this; an in-memory version ships for tests and
/// single-process deployments.
#[async_trait]
pub trait SecondaryStorage: Send + Sync {
    /// Atomically increment, setting expiry when the key is created.
    /// Returns the post-increment value.
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64>;
    async fn get(&self, key: &str) -> Result<Option<u64>>;
    /// Overwrite the counter with a fresh expiry; the fallback path for
    /// stores whose increment cannot attach a TTL atomically.
    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemorySecondaryStorage {
    entries: Mutex<HashMap<String, (u64, DateTime<Utc>)>>,
}

#[async_trait]
impl SecondaryStorage for InMemorySecondaryStorage {
    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        match entries.get_mut(key) {
            Some((count, expires_at)) if now < *expires_at => {
                *count += 1;
                Ok(*count)
            }
            _ => {
                entries.insert(key.to_string(), (1, now + ttl));
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let entries = self.entries.lock().await;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| now < *expires_at)
            .map(|(count, _)| *count))
    }

    async fn set_ex(&self, key: &str, value: u64, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, Utc::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

pub struct SecondaryRateLimiter {
    storage: Arc<dyn SecondaryStorage>,
}

impl SecondaryRateLimiter {
    pub fn new(storage: Arc<dyn SecondaryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RateLimiterBackend for SecondaryRateLimiter {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let count = self.storage.get(key).await?.unwrap_or(0);
        Ok(RateLimitDecision {
            allowed: count < limit,
            remaining: limit.saturating_sub(count),
            reset_at: Utc::now() + window,
            limit,
        })
    }

    async fn consume(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        let count = self.storage.incr_ex(key, window).await?;
        Ok(RateLimitDecision {
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
            reset_at: Utc::now() + window,
            limit,
        })
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.storage.delete(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_enforces_the_window_limit() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::seconds(60);
        for i in 0..3 {
            let decision = limiter.consume("client-a", 3, window).await.unwrap();
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, 2 - i);
        }
        let decision = limiter.consume("client-a", 3, window).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);

        // Another key is unaffected.
        assert!(limiter.consume("client-b", 3, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn memory_check_does_not_spend() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::seconds(60);
        for _ in 0..5 {
            assert!(limiter.check("k", 1, window).await.unwrap().allowed);
        }
        assert!(limiter.consume("k", 1, window).await.unwrap().allowed);
        assert!(!limiter.check("k", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn memory_reset_clears_the_bucket() {
        let limiter = MemoryRateLimiter::new();
        let window = Duration::seconds(60);
        limiter.consume("k", 1, window).await.unwrap();
        assert!(!limiter.consume("k", 1, window).await.unwrap().allowed);
        limiter.reset("k").await.unwrap();
        assert!(limiter.consume("k", 1, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn secondary_storage_set_ex_overwrites_with_fresh_expiry() {
        let storage = InMemorySecondaryStorage::default();
        let ttl = Duration::seconds(60);
        assert_eq!(storage.incr_ex("k", ttl).await.unwrap(), 1);
        storage.set_ex("k", 5, ttl).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some(5));
        assert_eq!(storage.incr_ex("k", ttl).await.unwrap(), 6);

        // An already-expired value reads back as absent.
        storage.set_ex("gone", 3, Duration::seconds(-1)).await.unwrap();
        assert_eq!(storage.get("gone").await.unwrap(), None);
    }

    #[tokio::test]
    async fn secondary_backend_counts_through_the_trait() {
        let limiter = SecondaryRateLimiter::new(Arc::new(InMemorySecondaryStorage::default()));
        let window = Duration::seconds(60);
        assert!(limiter.consume("k", 2, window).await.unwrap().allowed);
        assert!(limiter.consume("k", 2, window).await.unwrap().allowed);
        let decision = limiter.consume("k", 2, window).await.unwrap();
        assert!(!decision.allowed);
        limiter.reset("k").await.unwrap();
        assert!(limiter.consume("k", 2, window).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn retry_after_is_non_negative() {
        let limiter = MemoryRateLimiter::new();
        let decision = limiter
            .consume("k", 1, Duration::seconds(30))
            .await
            .unwrap();
        assert!(decision.retry_after_secs() >= 0);
        assert!(decision.retry_after_secs() <= 30);
    }
}
