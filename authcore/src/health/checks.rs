use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::auth::permission_cache::PermissionCache;
use crate::auth::revocation::RevocationStore;
use crate::email::ResetNotifier;
use crate::health::{CheckFailure, HealthCheck};
use crate::identity::IdentityStore;

/// The identity store. Critical: nothing works without it.
pub struct IdentityStoreCheck(pub Arc<dyn IdentityStore>);

#[async_trait]
impl HealthCheck for IdentityStoreCheck {
    fn name(&self) -> &str {
        "identity_store"
    }

    fn critical(&self) -> bool {
        true
    }

    async fn check(&self) -> Result<Option<serde_json::Value>, CheckFailure> {
        self.0.ping().await.map(|_| None).map_err(|e| CheckFailure::failed(e.to_string()))
    }
}

pub struct RevocationStoreCheck(pub Arc<dyn RevocationStore>);

#[async_trait]
impl HealthCheck for RevocationStoreCheck {
    fn name(&self) -> &str {
        "revocation_store"
    }

    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> Result<Option<serde_json::Value>, CheckFailure> {
        self.0
            .ping()
            .await
            .map(|_| Some(json!({ "store": self.0.name() })))
            .map_err(|e| CheckFailure::failed(e.to_string()))
    }
}

pub struct EmailCheck(pub Arc<dyn ResetNotifier>);

#[async_trait]
impl HealthCheck for EmailCheck {
    fn name(&self) -> &str {
        "email"
    }

    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> Result<Option<serde_json::Value>, CheckFailure> {
        self.0.ping().await.map(|_| None).map_err(|e| CheckFailure::failed(e.to_string()))
    }
}

/// Reports cache statistics. Never fails.
pub struct PermissionCacheCheck(pub Arc<PermissionCache>);

#[async_trait]
impl HealthCheck for PermissionCacheCheck {
    fn name(&self) -> &str {
        "permission_cache"
    }

    fn critical(&self) -> bool {
        false
    }

    async fn check(&self) -> Result<Option<serde_json::Value>, CheckFailure> {
        serde_json::to_value(self.0.stats())
            .map(Some)
            .map_err(|e| CheckFailure::failed(e.to_string()))
    }
}
