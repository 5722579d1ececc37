//! Short-lived password reset tokens.
//!
//! Records are stored under `reset:{sha256(token)}` so the raw token never sits in a
//! store. The shared [`RevocationStore`] is preferred; if it is absent or fails, records
//! go to an in-process map that a background sweep keeps free of expired entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::revocation::{RevocationError, RevocationStore};
use crate::auth::tokens::TokenErrorKind;
use crate::errors::Error;
use crate::types::SubjectId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetTokenRecord {
    pub subject_id: SubjectId,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ResetTokenRecord {
    pub fn new(subject_id: SubjectId, ttl: Duration) -> Self {
        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        Self {
            subject_id,
            expires_at,
            created_at,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResetTokenError {
    #[error("reset token not found")]
    NotFound,

    #[error("reset token expired")]
    Expired,

    #[error("stored reset token record is unreadable")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] RevocationError),
}

impl From<ResetTokenError> for Error {
    fn from(err: ResetTokenError) -> Self {
        match err {
            ResetTokenError::NotFound => Error::InvalidToken {
                kind: TokenErrorKind::Unknown,
            },
            ResetTokenError::Expired => Error::InvalidToken {
                kind: TokenErrorKind::Expired,
            },
            ResetTokenError::Corrupt(e) => Error::Internal {
                operation: format!("decode reset token record: {e}"),
            },
            ResetTokenError::Store(e) => e.into(),
        }
    }
}

fn storage_key(token: &str) -> String {
    format!("reset:{:x}", Sha256::digest(token.as_bytes()))
}

type LocalRecords = Arc<RwLock<HashMap<String, ResetTokenRecord>>>;

#[derive(Clone)]
pub struct ResetTokenStore {
    shared: Option<Arc<dyn RevocationStore>>,
    local: LocalRecords,
}

impl ResetTokenStore {
    pub fn new(shared: Option<Arc<dyn RevocationStore>>) -> Self {
        Self {
            shared,
            local: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Process-local only.
    pub fn in_process() -> Self {
        Self::new(None)
    }

    fn local_insert(&self, key: String, record: ResetTokenRecord) {
        match self.local.write() {
            Ok(mut records) => {
                records.insert(key, record);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key, record);
            }
        }
    }

    fn local_get(&self, key: &str) -> Option<ResetTokenRecord> {
        match self.local.read() {
            Ok(records) => records.get(key).cloned(),
            Err(poisoned) => poisoned.into_inner().get(key).cloned(),
        }
    }

    fn local_remove(&self, key: &str) -> Option<ResetTokenRecord> {
        match self.local.write() {
            Ok(mut records) => records.remove(key),
            Err(poisoned) => poisoned.into_inner().remove(key),
        }
    }

    fn check(record: ResetTokenRecord) -> Result<ResetTokenRecord, ResetTokenError> {
        if record.is_expired(Utc::now()) {
            Err(ResetTokenError::Expired)
        } else {
            Ok(record)
        }
    }

    pub async fn store(&self, token: &str, record: &ResetTokenRecord, ttl: Duration) -> Result<(), ResetTokenError> {
        let key = storage_key(token);
        if let Some(shared) = &self.shared {
            let value = serde_json::to_string(record)?;
            match shared.put(&key, &value, ttl).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "Shared store rejected reset token, keeping it in process"),
            }
        }
        self.local_insert(key, record.clone());
        Ok(())
    }

    /// Look a token up without consuming it.
    pub async fn fetch(&self, token: &str) -> Result<ResetTokenRecord, ResetTokenError> {
        let key = storage_key(token);
        if let Some(shared) = &self.shared {
            match shared.get(&key).await {
                Ok(Some(value)) => return Self::check(serde_json::from_str(&value)?),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Shared store lookup failed, checking in-process records"),
            }
        }
        self.local_get(&key).map_or(Err(ResetTokenError::NotFound), Self::check)
    }

    pub async fn delete(&self, token: &str) -> Result<(), ResetTokenError> {
        let key = storage_key(token);
        self.local_remove(&key);
        if let Some(shared) = &self.shared {
            shared.delete(&key).await?;
        }
        Ok(())
    }

    /// Atomically fetch and remove a token. At most one caller gets the record.
    pub async fn consume(&self, token: &str) -> Result<ResetTokenRecord, ResetTokenError> {
        let key = storage_key(token);
        if let Some(shared) = &self.shared {
            match shared.take(&key).await {
                Ok(Some(value)) => return Self::check(serde_json::from_str(&value)?),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Shared store take failed, checking in-process records"),
            }
        }
        self.local_remove(&key).map_or(Err(ResetTokenError::NotFound), Self::check)
    }

    /// Remove expired in-process records. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut records = match self.local.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Reset token sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = store.sweep();
                        if removed > 0 {
                            debug!(removed, "Swept expired reset tokens");
                        }
                    }
                }
            }
        })
    }

    #[cfg(test)]
    fn local_len(&self) -> usize {
        self.local.read().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::revocation::MemoryRevocationStore;
    use async_trait::async_trait;
    use uuid::Uuid;

    /// A shared store that is always down.
    struct BrokenStore;

    #[async_trait]
    impl RevocationStore for BrokenStore {
        fn name(&self) -> &'static str {
            "broken"
        }
        async fn put(&self, _: &str, _: &str, _: Duration) -> Result<(), RevocationError> {
            Err(RevocationError::Unavailable("down".into()))
        }
        async fn put_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, RevocationError> {
            Err(RevocationError::Unavailable("down".into()))
        }
        async fn get(&self, _: &str) -> Result<Option<String>, RevocationError> {
            Err(RevocationError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), RevocationError> {
            Err(RevocationError::Unavailable("down".into()))
        }
        async fn take(&self, _: &str) -> Result<Option<String>, RevocationError> {
            Err(RevocationError::Unavailable("down".into()))
        }
        async fn ping(&self) -> Result<(), RevocationError> {
            Err(RevocationError::Unavailable("down".into()))
        }
    }

    fn record(ttl: Duration) -> ResetTokenRecord {
        ResetTokenRecord::new(Uuid::new_v4(), ttl)
    }

    #[test]
    fn test_storage_key_hides_token() {
        let key = storage_key("raw-token");
        assert!(key.starts_with("reset:"));
        assert!(!key.contains("raw-token"));
        assert_eq!(key.len(), "reset:".len() + 64);
    }

    #[tokio::test]
    async fn test_shared_store_single_use() {
        let shared = Arc::new(MemoryRevocationStore::default());
        let store = ResetTokenStore::new(Some(shared));
        let rec = record(Duration::from_secs(3600));
        store.store("t1", &rec, Duration::from_secs(3600)).await.unwrap();

        assert_eq!(store.fetch("t1").await.unwrap(), rec);
        assert_eq!(store.consume("t1").await.unwrap(), rec);
        assert!(matches!(store.consume("t1").await, Err(ResetTokenError::NotFound)));
        assert!(matches!(store.fetch("t1").await, Err(ResetTokenError::NotFound)));
        assert_eq!(store.local_len(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_to_process_when_shared_store_fails() {
        let store = ResetTokenStore::new(Some(Arc::new(BrokenStore)));
        let rec = record(Duration::from_secs(3600));
        store.store("t1", &rec, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(store.local_len(), 1);
        assert_eq!(store.fetch("t1").await.unwrap(), rec);
        assert_eq!(store.consume("t1").await.unwrap(), rec);
        assert!(matches!(store.consume("t1").await, Err(ResetTokenError::NotFound)));
    }

    #[tokio::test]
    async fn test_expired_records_and_sweep() {
        let store = ResetTokenStore::in_process();
        let mut expired = record(Duration::from_secs(3600));
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.store("old", &expired, Duration::from_secs(1)).await.unwrap();
        store.store("new", &record(Duration::from_secs(3600)), Duration::from_secs(3600)).await.unwrap();

        assert!(matches!(store.fetch("old").await, Err(ResetTokenError::Expired)));
        assert_eq!(store.sweep(), 1);
        assert!(matches!(store.fetch("old").await, Err(ResetTokenError::NotFound)));
        assert!(store.fetch("new").await.is_ok());

        store.delete("new").await.unwrap();
        assert!(matches!(store.fetch("new").await, Err(ResetTokenError::NotFound)));
    }

    #[tokio::test]
    async fn test_concurrent_consume_has_one_winner() {
        let store = ResetTokenStore::new(Some(Arc::new(MemoryRevocationStore::default())));
        store
            .store("t", &record(Duration::from_secs(60)), Duration::from_secs(60))
            .await
            .unwrap();
        let attempts = (0..8).map(|_| {
            let store = store.clone();
            async move { store.consume("t").await.is_ok() }
        });
        let winners = futures::future::join_all(attempts).await.into_iter().filter(|ok| *ok).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let store = ResetTokenStore::in_process();
        let shutdown = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_millis(10), shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(Error::from(ResetTokenError::NotFound).code(), "INVALID_TOKEN");
        assert_eq!(Error::from(ResetTokenError::Expired).code(), "TOKEN_EXPIRED");
    }
}
