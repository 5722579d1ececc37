//! Read-through cache of each subject's role set and effective permissions.
//!
//! Entries are keyed by `(subject, generation)`. The generation is an opaque marker kept
//! in the [`RevocationStore`] under `permgen:{subject}` and replaced by
//! [`PermissionCache::invalidate`], so with a shared store a role change on one instance
//! retires the cached entries of every instance. A load that started before an
//! invalidation can only populate a key nobody reads again. Concurrent misses on the
//! same key share one load (moka's `try_get_with`).
//!
//! Entries expire `ttl` after their load *started*, and generation markers live for twice
//! that, so an entry loaded before an invalidation is always gone before its marker is.

use moka::{Expiry, future::Cache};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::revocation::{MemoryRevocationStore, RevocationStore};
use crate::config::PermissionCacheConfig;
use crate::db::errors::DbError;
use crate::errors::{Error, Result};
use crate::identity::IdentityStore;
use crate::types::{SubjectId, abbrev_uuid};

/// Roles and permissions of one subject, both sorted and deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    /// Hits over lookups, 0 before the first lookup
    pub hit_rate: f64,
}

/// `None` until the first invalidation of a key
type Generation = Option<String>;

#[derive(Clone)]
struct Cached<V> {
    started: Instant,
    value: V,
}

/// Expire `ttl` after the load began rather than after the insert.
struct FromLoadStart(Duration);

impl<K, V> Expiry<K, Cached<V>> for FromLoadStart {
    fn expire_after_create(&self, _key: &K, cached: &Cached<V>, created_at: Instant) -> Option<Duration> {
        Some(self.0.saturating_sub(created_at.saturating_duration_since(cached.started)))
    }
}

pub struct PermissionCache {
    store: Arc<dyn IdentityStore>,
    generations: Arc<dyn RevocationStore>,
    generation_ttl: Duration,
    subjects: Cache<(SubjectId, Generation), Cached<Arc<Authorization>>>,
    roles: Cache<(String, Generation), Cached<Option<Arc<Vec<String>>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn subject_generation_key(id: SubjectId) -> String {
    format!("permgen:{id}")
}

fn role_generation_key(role: &str) -> String {
    format!("permgen:role:{role}")
}

fn lookup_error(err: &DbError) -> Error {
    match err {
        DbError::Unavailable(_) | DbError::Retryable { .. } => Error::Unavailable {
            dependency: "identity store".to_string(),
        },
        _ => Error::Internal {
            operation: "resolve permissions".to_string(),
        },
    }
}

async fn load_authorization(store: &dyn IdentityStore, id: SubjectId) -> std::result::Result<Authorization, DbError> {
    let roles = store.roles_of_subject(id).await?;
    let permissions = store.permissions_of_subject(id).await?;
    debug!(roles = roles.len(), permissions = permissions.len(), "Loaded authorization");
    Ok(Authorization { roles, permissions })
}

async fn load_role(store: &dyn IdentityStore, role: &str) -> std::result::Result<Option<Arc<Vec<String>>>, DbError> {
    Ok(store.get_role(role).await?.map(|found| Arc::new(found.permissions)))
}

impl PermissionCache {
    /// Cache whose invalidations are published through `generations`. Pass the shared
    /// revocation store when several instances serve the same identity store.
    pub fn new(store: Arc<dyn IdentityStore>, generations: Arc<dyn RevocationStore>, config: &PermissionCacheConfig) -> Self {
        Self::build(store, generations, config.ttl, config.max_capacity)
    }

    /// Cache with process-local invalidation, for a single instance.
    pub fn with_ttl(store: Arc<dyn IdentityStore>, ttl: Duration, max_capacity: u64) -> Self {
        Self::build(store, Arc::new(MemoryRevocationStore::new()), ttl, max_capacity)
    }

    fn build(store: Arc<dyn IdentityStore>, generations: Arc<dyn RevocationStore>, ttl: Duration, max_capacity: u64) -> Self {
        Self {
            store,
            generations,
            generation_ttl: ttl.saturating_mul(2).max(Duration::from_secs(1)),
            subjects: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(FromLoadStart(ttl))
                .build(),
            roles: Cache::builder().max_capacity(1_000).expire_after(FromLoadStart(ttl)).build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Current generation of `key`, or `Err` when the store cannot say.
    async fn generation(&self, key: &str) -> std::result::Result<Generation, ()> {
        self.generations.get(key).await.map_err(|e| {
            warn!(error = %e, store = self.generations.name(), "Permission generation unavailable, bypassing cache");
        })
    }

    async fn bump(&self, key: &str) -> Result<()> {
        let generation = Uuid::new_v4().to_string();
        self.generations.put(key, &generation, self.generation_ttl).await?;
        Ok(())
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("authcore_permission_cache_hits_total").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("authcore_permission_cache_misses_total").increment(1);
        }
    }

    /// Roles and permissions of `id`, loading from the identity store on a miss.
    ///
    /// When the generation store fails the lookup goes straight to the identity store
    /// and nothing is cached.
    #[instrument(skip(self), fields(subject_id = %abbrev_uuid(&id)))]
    pub async fn authorization(&self, id: SubjectId) -> Result<Arc<Authorization>> {
        let started = Instant::now();
        let Ok(generation) = self.generation(&subject_generation_key(id)).await else {
            self.record(false);
            let loaded = load_authorization(self.store.as_ref(), id).await.map_err(|e| lookup_error(&e))?;
            return Ok(Arc::new(loaded));
        };

        let key = (id, generation);
        if let Some(cached) = self.subjects.get(&key).await {
            self.record(true);
            return Ok(cached.value);
        }
        self.record(false);

        let store = self.store.clone();
        self.subjects
            .try_get_with(key, async move {
                let loaded = load_authorization(store.as_ref(), id).await?;
                Ok::<_, DbError>(Cached {
                    started,
                    value: Arc::new(loaded),
                })
            })
            .await
            .map(|cached| cached.value)
            .map_err(|e| {
                warn!(error = %e, "Failed to load subject authorization");
                lookup_error(&e)
            })
    }

    pub async fn permissions_of(&self, id: SubjectId) -> Result<Vec<String>> {
        Ok(self.authorization(id).await?.permissions.clone())
    }

    pub async fn roles_of(&self, id: SubjectId) -> Result<Vec<String>> {
        Ok(self.authorization(id).await?.roles.clone())
    }

    /// Permissions carried by `role`, or `None` if no such role exists.
    #[instrument(skip(self))]
    pub async fn permissions_of_role(&self, role: &str) -> Result<Option<Arc<Vec<String>>>> {
        let started = Instant::now();
        let Ok(generation) = self.generation(&role_generation_key(role)).await else {
            self.record(false);
            return load_role(self.store.as_ref(), role).await.map_err(|e| lookup_error(&e));
        };

        let key = (role.to_string(), generation);
        if let Some(cached) = self.roles.get(&key).await {
            self.record(true);
            return Ok(cached.value);
        }
        self.record(false);

        let store = self.store.clone();
        let name = role.to_string();
        self.roles
            .try_get_with(key, async move {
                let loaded = load_role(store.as_ref(), &name).await?;
                Ok::<_, DbError>(Cached { started, value: loaded })
            })
            .await
            .map(|cached| cached.value)
            .map_err(|e| {
                warn!(error = %e, "Failed to load role");
                lookup_error(&e)
            })
    }

    /// Retire everything cached for `id` on every instance sharing the generation store.
    /// Later lookups are guaranteed to reload.
    pub async fn invalidate(&self, id: SubjectId) -> Result<()> {
        self.bump(&subject_generation_key(id)).await?;
        debug!(subject_id = %abbrev_uuid(&id), "Invalidated cached authorization");
        Ok(())
    }

    pub async fn invalidate_role(&self, role: &str) -> Result<()> {
        self.bump(&role_generation_key(role)).await
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            entries: self.subjects.entry_count(),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{NewSubject, memory::MemoryIdentityStore};

    async fn fixture() -> (Arc<MemoryIdentityStore>, PermissionCache, SubjectId) {
        let store = Arc::new(MemoryIdentityStore::new());
        store.create_role("reader", "", &["products.read".into()]).await.unwrap();
        store.create_role("writer", "", &["products.write".into()]).await.unwrap();
        let subject = store
            .create(
                NewSubject {
                    email: "s@example.com".into(),
                    username: "subject".into(),
                    password_digest: "digest".into(),
                    display_name: None,
                },
                &["reader".into()],
            )
            .await
            .unwrap();
        let cache = PermissionCache::with_ttl(store.clone(), Duration::from_secs(300), 100);
        (store, cache, subject.id)
    }

    #[tokio::test]
    async fn test_hits_after_first_load() {
        let (_store, cache, id) = fixture().await;
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);
        assert_eq!(cache.roles_of(id).await.unwrap(), vec!["reader"]);
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert!(stats.hit_rate > 0.6);
    }

    #[tokio::test]
    async fn test_role_change_then_invalidate_is_never_stale() {
        let (store, cache, id) = fixture().await;
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);

        store.assign_role(id, "writer", None).await.unwrap();
        // Without invalidation the cached entry is still served
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);

        cache.invalidate(id).await.unwrap();
        let permissions = cache.permissions_of(id).await.unwrap();
        assert!(permissions.contains(&"products.write".to_string()));
        assert!(permissions.contains(&"products.read".to_string()));
    }

    #[tokio::test]
    async fn test_store_outage_is_a_dependency_error() {
        let (store, cache, id) = fixture().await;
        store.set_available(false);
        assert!(matches!(cache.permissions_of(id).await, Err(Error::Unavailable { .. })));

        // Failed loads are not cached
        store.set_available(true);
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);
    }

    #[tokio::test]
    async fn test_role_permissions() {
        let (store, cache, _id) = fixture().await;
        assert_eq!(
            cache.permissions_of_role("writer").await.unwrap().as_deref(),
            Some(&vec!["products.write".to_string()])
        );
        assert!(cache.permissions_of_role("missing").await.unwrap().is_none());

        store.set_role_permissions("writer", &["products.*".into()]).await.unwrap();
        cache.invalidate_role("writer").await.unwrap();
        assert_eq!(
            cache.permissions_of_role("writer").await.unwrap().as_deref(),
            Some(&vec!["products.*".to_string()])
        );
    }

    #[tokio::test]
    async fn test_concurrent_loads_agree() {
        let (_store, cache, id) = fixture().await;
        let cache = Arc::new(cache);
        let loads = (0..16).map(|_| {
            let cache = cache.clone();
            async move { cache.permissions_of(id).await.unwrap() }
        });
        for permissions in futures::future::join_all(loads).await {
            assert_eq!(permissions, vec!["products.read"]);
        }
    }

    #[tokio::test]
    async fn test_invalidation_reaches_instances_sharing_generations() {
        let (store, _local, id) = fixture().await;
        let shared: Arc<dyn RevocationStore> = Arc::new(MemoryRevocationStore::new());
        let config = PermissionCacheConfig {
            ttl: Duration::from_secs(300),
            max_capacity: 100,
        };
        let a = PermissionCache::new(store.clone(), shared.clone(), &config);
        let b = PermissionCache::new(store.clone(), shared, &config);

        assert_eq!(b.permissions_of(id).await.unwrap(), vec!["products.read"]);
        assert_eq!(b.permissions_of_role("writer").await.unwrap().as_deref(), Some(&vec!["products.write".to_string()]));

        store.assign_role(id, "writer", None).await.unwrap();
        store.set_role_permissions("writer", &["products.*".into()]).await.unwrap();
        a.invalidate(id).await.unwrap();
        a.invalidate_role("writer").await.unwrap();

        assert!(b.permissions_of(id).await.unwrap().contains(&"products.*".to_string()));
        assert_eq!(b.permissions_of_role("writer").await.unwrap().as_deref(), Some(&vec!["products.*".to_string()]));
    }

    #[tokio::test]
    async fn test_generation_markers_expire() {
        let store = Arc::new(MemoryIdentityStore::new());
        let generations = Arc::new(MemoryRevocationStore::new());
        let config = PermissionCacheConfig {
            ttl: Duration::from_millis(20),
            max_capacity: 100,
        };
        let cache = PermissionCache::new(store, generations.clone(), &config);
        let id = uuid::Uuid::new_v4();

        cache.invalidate(id).await.unwrap();
        assert!(generations.get(&subject_generation_key(id)).await.unwrap().is_some());

        // Markers live for max(2 * ttl, 1s), then nothing is left behind
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(generations.get(&subject_generation_key(id)).await.unwrap().is_none());
        assert_eq!(generations.len().await, 0);
    }

    #[tokio::test]
    async fn test_entries_expire_from_load_start() {
        let (store, _cache, id) = fixture().await;
        let cache = PermissionCache::with_ttl(store, Duration::from_millis(50), 100);
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.permissions_of(id).await.unwrap(), vec!["products.read"]);
        assert_eq!(cache.stats().misses, 2);
    }
}
