//! Key-value store with per-key TTL backing token revocation.
//!
//! Everything that must outlive a single request and be visible to every
//! validation goes through [`RevocationStore`]:
//!
//! - token blacklist entries, keyed by the token string
//! - subject markers, keyed `subject:{id}`, for mass invalidation
//! - account locks, keyed `lockout:{id}`
//! - password reset records, keyed `reset:{digest}`
//!
//! Two implementations ship with the crate: [`MemoryRevocationStore`] for single
//! instance deployments and tests, and the Postgres store in
//! [`crate::db::handlers::revocations`] for fleets.

use async_trait::async_trait;
use moka::{Expiry, future::Cache};
use std::time::{Duration, Instant};

use crate::db::errors::DbError;
use crate::errors::Error;

#[derive(Debug, thiserror::Error)]
pub enum RevocationError {
    #[error("revocation store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Database(#[from] DbError),
}

impl From<RevocationError> for Error {
    fn from(err: RevocationError) -> Self {
        match err {
            RevocationError::Unavailable(reason) => {
                tracing::warn!(%reason, "Revocation store unavailable");
                Error::Unavailable {
                    dependency: "revocation store".to_string(),
                }
            }
            RevocationError::Database(db) => Error::Database(db),
        }
    }
}

/// Shared key-value store with per-key expiry.
///
/// `Ok(None)` means the key is absent or expired; errors are reserved for the
/// store itself failing.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Short label used in logs and health output
    fn name(&self) -> &'static str;

    /// Insert or overwrite `key`. A zero TTL removes the key instead.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RevocationError>;

    /// Insert `key` only if no live entry exists. Returns whether this call wrote it.
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, RevocationError>;

    async fn get(&self, key: &str) -> Result<Option<String>, RevocationError>;

    async fn delete(&self, key: &str) -> Result<(), RevocationError>;

    /// Atomically read and remove `key`.
    async fn take(&self, key: &str) -> Result<Option<String>, RevocationError>;

    /// Cheap round trip used by readiness checks.
    async fn ping(&self) -> Result<(), RevocationError>;

    /// Drop expired entries. Returns how many were removed, where the backend can tell.
    async fn purge_expired(&self) -> Result<u64, RevocationError> {
        Ok(0)
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, entry: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Process-local store. Entries vanish on restart and are not shared between instances.
///
/// The cache is unbounded: an entry only leaves through its own expiry or an explicit
/// delete, never through size-based eviction.
#[derive(Clone)]
pub struct MemoryRevocationStore {
    entries: Cache<String, Entry>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().expire_after(PerEntryTtl).build(),
        }
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

impl Default for MemoryRevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RevocationError> {
        if ttl.is_zero() {
            self.entries.invalidate(key).await;
            return Ok(());
        }
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, RevocationError> {
        if ttl.is_zero() {
            return Ok(false);
        }
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(async {
                Entry {
                    value: value.to_string(),
                    ttl,
                }
            })
            .await;
        Ok(entry.is_fresh())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, RevocationError> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn delete(&self, key: &str) -> Result<(), RevocationError> {
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, RevocationError> {
        Ok(self.entries.remove(key).await.map(|entry| entry.value))
    }

    async fn ping(&self) -> Result<(), RevocationError> {
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, RevocationError> {
        let before = self.entries.entry_count();
        self.entries.run_pending_tasks().await;
        Ok(before.saturating_sub(self.entries.entry_count()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryRevocationStore::default();
        store.put("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_absent_is_not_an_error() {
        let store = MemoryRevocationStore::default();
        assert!(matches!(store.get("missing").await, Ok(None)));
        assert!(matches!(store.take("missing").await, Ok(None)));
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryRevocationStore::default();
        store.put("short", "v", Duration::from_millis(50)).await.unwrap();
        store.put("long", "v", Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(store.get("short").await.unwrap(), None);
        assert_eq!(store.get("long").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_zero_ttl_removes() {
        let store = MemoryRevocationStore::default();
        store.put("k", "v", Duration::from_secs(60)).await.unwrap();
        store.put("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_take_is_single_use() {
        let store = MemoryRevocationStore::default();
        store.put("reset:abc", "payload", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.take("reset:abc").await.unwrap().as_deref(), Some("payload"));
        assert_eq!(store.take("reset:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_if_absent_only_first_wins() {
        let store = MemoryRevocationStore::default();
        assert!(store.put_if_absent("tok", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!store.put_if_absent("tok", "2", Duration::from_secs(60)).await.unwrap());
        assert_eq!(store.get("tok").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_purge_expired_counts_removed() {
        let store = MemoryRevocationStore::default();
        store.put("a", "v", Duration::from_millis(20)).await.unwrap();
        store.put("b", "v", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        store.purge_expired().await.unwrap();
        assert_eq!(store.len().await, 1);
    }
}
