//! Postgres-backed token buckets, shared by every instance.
//!
//! Each acquisition locks the bucket row for the length of one short transaction, so
//! concurrent requests against the same key are serialized by the database. Times come
//! from `clock_timestamp()`, not the transaction start, and `updated_at` never moves
//! backwards, so a transaction that waited on the lock cannot refill a bucket twice.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;

use crate::db::errors::Result;
use crate::limits::{BucketPolicy, Decision, RateLimitStore};

#[derive(Clone, Debug)]
pub struct PgBucketStore {
    pool: PgPool,
}

impl PgBucketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RateLimitStore for PgBucketStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip(self, policy), err)]
    async fn acquire(&self, key: &str, policy: &BucketPolicy) -> Result<Decision> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO rate_limit_buckets (key, tokens, updated_at) VALUES ($1, $2, clock_timestamp()) ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .bind(policy.capacity)
            .execute(&mut *tx)
            .await?;

        let (tokens, elapsed_secs) = sqlx::query_as::<_, (f64, f64)>(
            r#"
            SELECT tokens, GREATEST(EXTRACT(EPOCH FROM (clock_timestamp() - updated_at)), 0)::DOUBLE PRECISION
            FROM rate_limit_buckets WHERE key = $1
            FOR UPDATE
            "#,
        )
        .bind(key)
        .fetch_one(&mut *tx)
        .await?;

        let refilled = policy.refill(tokens, Duration::from_secs_f64(elapsed_secs));
        let (tokens, decision) = policy.take(refilled);

        sqlx::query("UPDATE rate_limit_buckets SET tokens = $2, updated_at = GREATEST(updated_at, clock_timestamp()) WHERE key = $1")
            .bind(key)
            .bind(tokens)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(decision)
    }

    #[instrument(skip(self), err)]
    async fn evict_idle(&self, idle: Duration) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limit_buckets WHERE updated_at < NOW() - MAKE_INTERVAL(secs => $1)")
            .bind(idle.as_secs_f64())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test]
    async fn test_burst_then_reject(pool: PgPool) {
        let store = PgBucketStore::new(pool);
        // Slow refill so the test does not race the clock
        let policy = BucketPolicy::new(0.001, 3);
        for _ in 0..3 {
            assert!(store.acquire("addr:203.0.113.7", &policy).await.unwrap().is_allowed());
        }
        assert!(matches!(
            store.acquire("addr:203.0.113.7", &policy).await.unwrap(),
            Decision::Limited { .. }
        ));
        assert!(store.acquire("addr:203.0.113.8", &policy).await.unwrap().is_allowed());
    }

    #[sqlx::test]
    async fn test_concurrent_acquisitions_respect_capacity(pool: PgPool) {
        let store = PgBucketStore::new(pool);
        let policy = BucketPolicy::new(0.001, 4);
        let attempts = (0..10).map(|_| {
            let store = store.clone();
            async move { store.acquire("subject:shared", &policy).await.unwrap() }
        });
        let allowed = futures::future::join_all(attempts)
            .await
            .into_iter()
            .filter(Decision::is_allowed)
            .count();
        assert_eq!(allowed, 4);
    }

    #[sqlx::test]
    async fn test_updated_at_never_moves_backwards(pool: PgPool) {
        let store = PgBucketStore::new(pool.clone());
        let policy = BucketPolicy::new(0.001, 2);
        assert!(store.acquire("k", &policy).await.unwrap().is_allowed());

        // Another writer stamped the bucket later than this clock reads
        let ahead: chrono::DateTime<chrono::Utc> = sqlx::query_scalar(
            "UPDATE rate_limit_buckets SET updated_at = clock_timestamp() + INTERVAL '1 hour' WHERE key = 'k' RETURNING updated_at",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert!(store.acquire("k", &policy).await.unwrap().is_allowed());
        let stamped: chrono::DateTime<chrono::Utc> = sqlx::query_scalar("SELECT updated_at FROM rate_limit_buckets WHERE key = 'k'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stamped, ahead);
        // No refill came out of the skewed stamp
        assert!(!store.acquire("k", &policy).await.unwrap().is_allowed());
    }

    #[sqlx::test]
    async fn test_evict_idle(pool: PgPool) {
        let store = PgBucketStore::new(pool.clone());
        let policy = BucketPolicy::new(1.0, 1);
        store.acquire("old", &policy).await.unwrap();
        store.acquire("fresh", &policy).await.unwrap();
        sqlx::query("UPDATE rate_limit_buckets SET updated_at = NOW() - INTERVAL '1 hour' WHERE key = 'old'")
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(store.evict_idle(Duration::from_secs(600)).await.unwrap(), 1);
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_buckets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(left, 1);
    }
}
