//! Transaction helpers.
//!
//! [`within_transaction`] runs a closure in one transaction, committing on `Ok` and
//! rolling back on `Err`. [`with_retry_transaction`] does the same but reruns the whole
//! closure when the failure is a serialization conflict or deadlock
//! ([`DbError::is_retryable`]). Closures signal retry themselves by returning
//! [`DbError::Retryable`].
//!
//! The closure receives the connection and returns a boxed future borrowing it:
//!
//! ```ignore
//! let subject = with_retry_transaction(pools.write(), &RetryPolicy::default(), |conn| {
//!     let new = new.clone();
//!     Box::pin(async move { Subjects::new(conn).create(&new).await })
//! })
//! .await?;
//! ```

use futures::future::BoxFuture;
use rand::RngExt;
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::errors::{DbError, Result};

pub type TxFuture<'t, T> = BoxFuture<'t, Result<T>>;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`, capped,
    /// plus up to half of that again as jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 2;
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        delay + Duration::from_millis(jitter)
    }
}

async fn finish<T>(tx: sqlx::Transaction<'_, sqlx::Postgres>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Run `f` in a single transaction on `pool`.
pub async fn within_transaction<T, F>(pool: &PgPool, f: F) -> Result<T>
where
    F: for<'t> FnOnce(&'t mut PgConnection) -> TxFuture<'t, T>,
{
    let mut tx = pool.begin().await?;
    let result = f(&mut *tx).await;
    finish(tx, result).await
}

/// Run `f` in a transaction, retrying the whole transaction on transient conflicts.
pub async fn with_retry_transaction<T, F>(pool: &PgPool, policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: for<'t> FnMut(&'t mut PgConnection) -> TxFuture<'t, T>,
{
    let mut attempt = 1;
    loop {
        let mut tx = pool.begin().await?;
        let result = f(&mut *tx).await;
        match finish(tx, result).await {
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying transaction");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => {
                if attempt > 1 && result.is_ok() {
                    debug!(attempt, "Transaction succeeded after retry");
                }
                return result;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        };
        let first = policy.delay_for_attempt(1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        let late = policy.delay_for_attempt(9);
        assert!(late >= Duration::from_millis(100) && late <= Duration::from_millis(150));
    }

    async fn count_keys(pool: &PgPool, key: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM revocations WHERE key = $1")
            .bind(key)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    fn insert<'a>(conn: &'a mut PgConnection, key: &'static str) -> TxFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("INSERT INTO revocations (key, value, expires_at) VALUES ($1, 'v', NOW() + INTERVAL '1 hour')")
                .bind(key)
                .execute(conn)
                .await?;
            Ok(())
        })
    }

    #[sqlx::test]
    async fn test_commit_on_success(pool: PgPool) {
        within_transaction(&pool, |conn| insert(conn, "committed")).await.unwrap();
        assert_eq!(count_keys(&pool, "committed").await, 1);
    }

    #[sqlx::test]
    async fn test_rollback_on_error(pool: PgPool) {
        let result: Result<()> = within_transaction(&pool, |conn| {
            Box::pin(async move {
                insert(conn, "rolled-back").await?;
                Err(DbError::NotFound)
            })
        })
        .await;
        assert!(matches!(result, Err(DbError::NotFound)));
        assert_eq!(count_keys(&pool, "rolled-back").await, 0);
    }

    #[sqlx::test]
    async fn test_retries_retryable_failures(pool: PgPool) {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let counter = attempts.clone();
        with_retry_transaction(&pool, &policy, move |conn| {
            let counter = counter.clone();
            Box::pin(async move {
                insert(conn, "retried").await?;
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Err(DbError::Retryable { code: "40001".into() });
                }
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Failed attempts were rolled back, so the key exists exactly once
        assert_eq!(count_keys(&pool, "retried").await, 1);
    }

    #[sqlx::test]
    async fn test_gives_up_after_max_attempts(pool: PgPool) {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        };
        let counter = attempts.clone();
        let result: Result<()> = with_retry_transaction(&pool, &policy, move |_conn| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(DbError::Retryable { code: "40P01".into() }) })
        })
        .await;

        assert!(matches!(result, Err(DbError::Retryable { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
