//! Connection pools with optional read-replica routing.
//!
//! ```text
//!        DbPools
//!       /       \
//!   primary   replica (optional)
//! ```
//!
//! - `.read()` for follower-OK reads such as subject listing (replica if configured)
//! - `.write()` and `.begin()` for writes and read-after-write (always primary)

use sqlx::{PgPool, Postgres, Transaction, postgres::PgPoolOptions};
use std::{ops::Deref, time::Duration};
use tracing::info;

use crate::config::{DatabaseConfig, PoolSettings};

#[derive(Clone, Debug)]
pub struct DbPools {
    primary: PgPool,
    replica: Option<PgPool>,
}

impl DbPools {
    pub fn new(primary: PgPool) -> Self {
        Self { primary, replica: None }
    }

    pub fn with_replica(primary: PgPool, replica: PgPool) -> Self {
        Self {
            primary,
            replica: Some(replica),
        }
    }

    /// Connect the primary and, if configured, the replica.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let primary = pool_options(&config.pool).connect(&config.url).await?;
        match &config.replica_url {
            Some(replica_url) => {
                let settings = config.replica_pool.as_ref().unwrap_or(&config.pool);
                let replica = pool_options(settings).connect(replica_url).await?;
                info!("Connected primary and read replica pools");
                Ok(Self::with_replica(primary, replica))
            }
            None => Ok(Self::new(primary)),
        }
    }

    /// Pool for reads that tolerate replication lag. Falls back to the primary.
    pub fn read(&self) -> &PgPool {
        self.replica.as_ref().unwrap_or(&self.primary)
    }

    /// Pool for writes and reads that must observe them.
    pub fn write(&self) -> &PgPool {
        &self.primary
    }

    /// Transactions always run on the primary.
    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        self.primary.begin().await
    }

    pub fn has_replica(&self) -> bool {
        self.replica.is_some()
    }

    pub async fn close(&self) {
        self.primary.close().await;
        if let Some(replica) = &self.replica {
            replica.close().await;
        }
    }
}

/// Dereferences to the primary pool.
impl Deref for DbPools {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.primary
    }
}

fn pool_options(settings: &PoolSettings) -> PgPoolOptions {
    let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
    PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
        .idle_timeout(secs(settings.idle_timeout_secs))
        .max_lifetime(secs(settings.max_lifetime_secs))
}
