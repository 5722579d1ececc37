//! Login lockout.
//!
//! Failed logins are counted per `(source, account)` in a fixed window that opens on the
//! first failure. Reaching `max_attempts` locks the account for `lock_duration`. Locks
//! live in the revocation store under `lockout:{subject}` so every instance honours them;
//! without a store they are kept in process.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::auth::revocation::RevocationStore;
use crate::config::LockoutConfig;
use crate::errors::{Error, Result};
use crate::types::{SubjectId, abbrev_uuid};

fn lock_key(subject_id: SubjectId) -> String {
    format!("lockout:{subject_id}")
}

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    count: u32,
    opened: Instant,
}

pub struct LoginThrottle {
    config: LockoutConfig,
    store: Option<Arc<dyn RevocationStore>>,
    failures: DashMap<(String, String), FailureWindow>,
    local_locks: DashMap<SubjectId, DateTime<Utc>>,
}

impl LoginThrottle {
    pub fn new(config: LockoutConfig, store: Option<Arc<dyn RevocationStore>>) -> Self {
        Self {
            config,
            store,
            failures: DashMap::new(),
            local_locks: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    fn locked_until(value: &str) -> Option<DateTime<Utc>> {
        value.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
    }

    /// Fail with [`Error::AccountLocked`] if `subject_id` is currently locked.
    ///
    /// A failing store does not block logins.
    pub async fn ensure_unlocked(&self, subject_id: SubjectId) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Utc::now();
        let until = match &self.store {
            Some(store) => match store.get(&lock_key(subject_id)).await {
                Ok(value) => value.as_deref().and_then(Self::locked_until),
                Err(e) => {
                    warn!(error = %e, "Lockout lookup failed, allowing attempt");
                    None
                }
            },
            None => self.local_locks.get(&subject_id).map(|until| *until),
        };
        match until.and_then(|until| (until - now).to_std().ok()) {
            Some(retry_after) if !retry_after.is_zero() => Err(Error::AccountLocked { retry_after }),
            _ => Ok(()),
        }
    }

    /// Count a failed login. Returns whether this failure locked the account.
    pub async fn record_failure(&self, source: &str, email: &str, subject_id: Option<SubjectId>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = Instant::now();
        let count = {
            let mut window = self
                .failures
                .entry((source.to_string(), email.to_string()))
                .or_insert(FailureWindow { count: 0, opened: now });
            if now.duration_since(window.opened) >= self.config.window {
                *window = FailureWindow { count: 0, opened: now };
            }
            window.count += 1;
            window.count
        };

        let Some(subject_id) = subject_id else {
            return false;
        };
        if count < self.config.max_attempts {
            return false;
        }

        self.failures.remove(&(source.to_string(), email.to_string()));
        self.lock(subject_id).await;
        true
    }

    /// Clear the failure count after a successful login.
    pub fn record_success(&self, source: &str, email: &str) {
        self.failures.remove(&(source.to_string(), email.to_string()));
    }

    /// Lock `subject_id` for the configured duration.
    pub async fn lock(&self, subject_id: SubjectId) {
        let until = Utc::now() + chrono::Duration::from_std(self.config.lock_duration).unwrap_or(chrono::Duration::minutes(15));
        metrics::counter!("authcore_account_lockouts_total").increment(1);
        info!(subject_id = %abbrev_uuid(&subject_id), "Account locked after repeated failed logins");
        if let Some(store) = &self.store {
            let value = until.timestamp_millis().to_string();
            match store.put(&lock_key(subject_id), &value, self.config.lock_duration).await {
                Ok(()) => return,
                Err(e) => warn!(error = %e, "Failed to persist account lock, keeping it in process"),
            }
        }
        self.local_locks.insert(subject_id, until);
    }

    /// Drop failure windows and in-process locks that no longer matter.
    pub fn evict_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.failures.len() + self.local_locks.len();
        self.failures.retain(|_, window| now.duration_since(window.opened) < self.config.window);
        let wall = Utc::now();
        self.local_locks.retain(|_, until| *until > wall);
        before - (self.failures.len() + self.local_locks.len())
    }

    /// Whether the subject currently holds a live lock.
    pub async fn is_locked(&self, subject_id: SubjectId) -> bool {
        matches!(self.ensure_unlocked(subject_id).await, Err(Error::AccountLocked { .. }))
    }
}
