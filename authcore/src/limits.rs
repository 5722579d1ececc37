//! Request rate limiting.
//!
//! A token bucket per key: `burst` tokens of capacity, refilled at
//! `requests_per_second`. Requests carrying a principal are keyed `subject:{id}`,
//! anonymous ones by client address. Login and password reset additionally charge a
//! much smaller per-source bucket, see [`RateLimiter::check_auth_attempt`]. Buckets live in a [`RateLimitStore`], either
//! process-local ([`MemoryBucketStore`]) or shared through Postgres
//! ([`PgBucketStore`](crate::db::handlers::PgBucketStore)).

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::db::errors::Result as DbResult;
use crate::errors::{Error, Result};
use crate::types::SubjectId;

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl BucketPolicy {
    pub fn new(requests_per_second: f64, burst: u32) -> Self {
        Self {
            capacity: f64::from(burst),
            refill_per_sec: requests_per_second,
        }
    }

    /// `attempts` per `window`, refilled evenly across the window.
    pub fn per_window(attempts: u32, window: Duration) -> Self {
        Self {
            capacity: f64::from(attempts),
            refill_per_sec: f64::from(attempts) / window.as_secs_f64().max(f64::EPSILON),
        }
    }

    /// Tokens after `elapsed` of refill, capped at capacity.
    pub fn refill(&self, tokens: f64, elapsed: Duration) -> f64 {
        (tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity)
    }

    /// Try to take one token. Returns the new token count and the decision.
    pub fn take(&self, tokens: f64) -> (f64, Decision) {
        if tokens >= 1.0 {
            let left = tokens - 1.0;
            (
                left,
                Decision::Allowed {
                    remaining: left.floor() as u32,
                },
            )
        } else {
            let deficit = 1.0 - tokens;
            let retry_after = if self.refill_per_sec > 0.0 {
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            } else {
                Duration::MAX
            };
            (tokens, Decision::Limited { retry_after })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }
}

/// In-process bucket state.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    tokens: f64,
    updated: Instant,
}

impl TokenBucket {
    pub fn full(policy: &BucketPolicy, now: Instant) -> Self {
        Self {
            tokens: policy.capacity,
            updated: now,
        }
    }

    pub fn try_acquire(&mut self, policy: &BucketPolicy, now: Instant) -> Decision {
        let refilled = policy.refill(self.tokens, now.saturating_duration_since(self.updated));
        let (tokens, decision) = policy.take(refilled);
        self.tokens = tokens;
        self.updated = now;
        decision
    }

    fn idle_since(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.updated)
    }
}

/// Storage for token buckets.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Refill and take one token from the bucket under `key`, creating it full if absent.
    async fn acquire(&self, key: &str, policy: &BucketPolicy) -> DbResult<Decision>;

    /// Forget buckets untouched for at least `idle`. Returns how many were dropped.
    async fn evict_idle(&self, idle: Duration) -> DbResult<u64>;
}

/// Buckets in a `DashMap`. Each acquisition holds one shard lock briefly and never across
/// an `.await`.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, TokenBucket>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_at(&self, key: &str, policy: &BucketPolicy, now: Instant) -> Decision {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(policy, now))
            .try_acquire(policy, now)
    }

    pub fn evict_idle_at(&self, idle: Duration, now: Instant) -> u64 {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.idle_since(now) < idle);
        (before - self.buckets.len()) as u64
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[async_trait]
impl RateLimitStore for MemoryBucketStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, key: &str, policy: &BucketPolicy) -> DbResult<Decision> {
        Ok(self.acquire_at(key, policy, Instant::now()))
    }

    async fn evict_idle(&self, idle: Duration) -> DbResult<u64> {
        Ok(self.evict_idle_at(idle, Instant::now()))
    }
}

/// Identity a bucket is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitKey {
    Subject(SubjectId),
    Address(IpAddr),
    /// No principal and no resolvable client address. All such requests share one bucket
    Unidentified,
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitKey::Subject(id) => write!(f, "subject:{id}"),
            RateLimitKey::Address(addr) => write!(f, "addr:{addr}"),
            RateLimitKey::Unidentified => f.write_str("addr:unknown"),
        }
    }
}

/// Token-bucket limiter over a pluggable store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policy: BucketPolicy,
    auth_policy: BucketPolicy,
    trust_forwarded_headers: bool,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, policy: BucketPolicy, auth_policy: BucketPolicy) -> Self {
        Self {
            store,
            policy,
            auth_policy,
            trust_forwarded_headers: false,
        }
    }

    /// Returns `None` when rate limiting is disabled.
    pub fn from_config(config: &RateLimitConfig, store: Arc<dyn RateLimitStore>) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        Some(Self {
            store,
            policy: BucketPolicy::new(config.requests_per_second, config.burst),
            auth_policy: BucketPolicy::per_window(config.auth_attempts, config.auth_window),
            trust_forwarded_headers: config.trust_forwarded_headers,
        })
    }

    pub fn trusts_forwarded_headers(&self) -> bool {
        self.trust_forwarded_headers
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Charge one request to `key`.
    ///
    /// A failing shared store lets the request through: the limiter protects capacity, it
    /// is not an authorization decision.
    pub async fn check(&self, key: &RateLimitKey) -> Result<()> {
        self.charge(key.to_string(), &self.policy, "Rate limit exceeded").await
    }

    /// Charge one login or password reset attempt to the source `key`.
    ///
    /// These buckets are separate from the general ones and far smaller, so one source
    /// cannot spray guesses across many accounts.
    pub async fn check_auth_attempt(&self, key: &RateLimitKey) -> Result<()> {
        self.charge(format!("auth:{key}"), &self.auth_policy, "Too many authentication attempts")
            .await
    }

    async fn charge(&self, key: String, policy: &BucketPolicy, message: &str) -> Result<()> {
        match self.store.acquire(&key, policy).await {
            Ok(Decision::Allowed { remaining }) => {
                debug!(%key, remaining, "Rate limit token taken");
                Ok(())
            }
            Ok(Decision::Limited { retry_after }) => {
                metrics::counter!("authcore_rate_limit_rejections_total", "store" => self.store.name()).increment(1);
                Err(Error::TooManyRequests {
                    message: message.to_string(),
                    retry_after: Some(retry_after),
                })
            }
            Err(e) => {
                warn!(error = %e, store = self.store.name(), "Rate limit store failed, allowing request");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn policy(rps: f64, burst: u32) -> BucketPolicy {
        BucketPolicy::new(rps, burst)
    }

    #[test]
    fn test_burst_then_reject_in_same_instant() {
        let store = MemoryBucketStore::new();
        let policy = policy(1.0, 5);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(store.acquire_at("k", &policy, now).is_allowed());
        }
        match store.acquire_at("k", &policy, now) {
            Decision::Limited { retry_after } => assert_eq!(retry_after, Duration::from_secs(1)),
            other => panic!("expected limited, got {other:?}"),
        }
    }

    #[test]
    fn test_refill_over_time_is_capped() {
        let store = MemoryBucketStore::new();
        let policy = policy(2.0, 2);
        let start = Instant::now();
        assert!(store.acquire_at("k", &policy, start).is_allowed());
        assert!(store.acquire_at("k", &policy, start).is_allowed());
        assert!(!store.acquire_at("k", &policy, start).is_allowed());

        // Half a second at 2 rps refills one token
        let later = start + Duration::from_millis(500);
        assert!(store.acquire_at("k", &policy, later).is_allowed());
        assert!(!store.acquire_at("k", &policy, later).is_allowed());

        // A long pause refills only up to capacity
        let much_later = later + Duration::from_secs(60);
        assert!(store.acquire_at("k", &policy, much_later).is_allowed());
        assert!(store.acquire_at("k", &policy, much_later).is_allowed());
        assert!(!store.acquire_at("k", &policy, much_later).is_allowed());
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryBucketStore::new();
        let policy = policy(1.0, 1);
        let now = Instant::now();
        assert!(store.acquire_at("a", &policy, now).is_allowed());
        assert!(!store.acquire_at("a", &policy, now).is_allowed());
        assert!(store.acquire_at("b", &policy, now).is_allowed());
    }

    #[test]
    fn test_evict_idle() {
        let store = MemoryBucketStore::new();
        let policy = policy(1.0, 1);
        let now = Instant::now();
        store.acquire_at("old", &policy, now);
        store.acquire_at("fresh", &policy, now + Duration::from_secs(50));

        assert_eq!(store.evict_idle_at(Duration::from_secs(30), now + Duration::from_secs(60)), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_key_format() {
        let id = Uuid::nil();
        assert_eq!(
            RateLimitKey::Subject(id).to_string(),
            "subject:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(RateLimitKey::Address("203.0.113.7".parse().unwrap()).to_string(), "addr:203.0.113.7");
    }

    #[tokio::test]
    async fn test_limiter_maps_to_rate_limit_error() {
        let limiter = RateLimiter::new(Arc::new(MemoryBucketStore::new()), policy(0.5, 2), policy(0.5, 2));
        let key = RateLimitKey::Address("198.51.100.1".parse().unwrap());
        limiter.check(&key).await.unwrap();
        limiter.check(&key).await.unwrap();
        match limiter.check(&key).await {
            Err(Error::TooManyRequests { retry_after: Some(retry), .. }) => {
                assert!(retry > Duration::from_secs(1) && retry <= Duration::from_secs(2));
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_attempts_have_their_own_bucket() {
        let limiter = RateLimiter::new(
            Arc::new(MemoryBucketStore::new()),
            policy(1000.0, 1000),
            BucketPolicy::per_window(5, Duration::from_secs(15 * 60)),
        );
        let key = RateLimitKey::Address("198.51.100.9".parse().unwrap());
        for _ in 0..5 {
            limiter.check_auth_attempt(&key).await.unwrap();
        }
        match limiter.check_auth_attempt(&key).await {
            Err(Error::TooManyRequests { retry_after: Some(retry), .. }) => {
                // One attempt comes back every three minutes
                assert!(retry > Duration::from_secs(170) && retry <= Duration::from_secs(180));
            }
            other => panic!("expected rate limit error, got {other:?}"),
        }
        // The general bucket for the same source is untouched
        limiter.check(&key).await.unwrap();
    }

    #[test]
    fn test_per_window_policy() {
        let policy = BucketPolicy::per_window(5, Duration::from_secs(15 * 60));
        assert_eq!(policy.capacity, 5.0);
        assert!((policy.refill(0.0, Duration::from_secs(15 * 60)) - 5.0).abs() < 1e-9);
        assert!((policy.refill(0.0, Duration::from_secs(180)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_config_builds_no_limiter() {
        let config = RateLimitConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(RateLimiter::from_config(&config, Arc::new(MemoryBucketStore::new())).is_none());
    }
}
