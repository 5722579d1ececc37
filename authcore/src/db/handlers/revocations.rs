//! Postgres-backed [`RevocationStore`] shared by every instance of a fleet.
//!
//! Expired rows are invisible to reads immediately and physically removed by
//! [`RevocationStore::purge_expired`], which the background sweeper calls.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use tracing::instrument;

use crate::auth::revocation::{RevocationError, RevocationStore};
use crate::db::errors::DbError;

fn store_error(err: sqlx::Error) -> RevocationError {
    match DbError::from(err) {
        DbError::Unavailable(reason) => RevocationError::Unavailable(reason),
        other => RevocationError::Database(other),
    }
}

#[derive(Clone, Debug)]
pub struct PgRevocationStore {
    pool: PgPool,
}

impl PgRevocationStore {
    /// `pool` must be the primary: reads here have to observe the latest writes.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RevocationStore for PgRevocationStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    #[instrument(skip_all, err)]
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), RevocationError> {
        if ttl.is_zero() {
            return self.delete(key).await;
        }
        sqlx::query(
            r#"
            INSERT INTO revocations (key, value, expires_at)
            VALUES ($1, $2, NOW() + MAKE_INTERVAL(secs => $3))
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn put_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, RevocationError> {
        if ttl.is_zero() {
            return Ok(false);
        }
        // A conflicting row only gets replaced when it has already expired
        let written = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO revocations (key, value, expires_at)
            VALUES ($1, $2, NOW() + MAKE_INTERVAL(secs => $3))
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
                WHERE revocations.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(written.is_some())
    }

    #[instrument(skip_all, err)]
    async fn get(&self, key: &str) -> Result<Option<String>, RevocationError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM revocations WHERE key = $1 AND expires_at > NOW()")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)
    }

    #[instrument(skip_all, err)]
    async fn delete(&self, key: &str) -> Result<(), RevocationError> {
        sqlx::query("DELETE FROM revocations WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn take(&self, key: &str) -> Result<Option<String>, RevocationError> {
        let row = sqlx::query_as::<_, (String, bool)>(
            "DELETE FROM revocations WHERE key = $1 RETURNING value, expires_at > NOW()",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(row.and_then(|(value, live)| live.then_some(value)))
    }

    async fn ping(&self) -> Result<(), RevocationError> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn purge_expired(&self) -> Result<u64, RevocationError> {
        let result = sqlx::query("DELETE FROM revocations WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        Ok(result.rows_affected())
    }
}
