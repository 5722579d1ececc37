//! Authorization gates.
//!
//! A [`Gate`] is a predicate over the principal. Roles are resolved through the
//! permission cache rather than read from token claims, so a role change applies to the
//! next request instead of waiting for the token to expire.
//!
//! ```ignore
//! Router::new()
//!     .route("/admin/subjects", get(list_subjects))
//!     .route_layer(from_fn_with_state((state.clone(), requires_permission("users.read")), gate::enforce))
//! ```
//!
//! Failures never name the missing role or permission.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::{debug, instrument};

use crate::AppState;
use crate::auth::permission_cache::PermissionCache;
use crate::auth::principal::{Authenticated, Principal, attach, authenticate};
use crate::errors::{Error, Result};
use crate::types::{abbrev_uuid, any_grants};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Role(String),
    AnyRole(Vec<String>),
    AllRoles(Vec<String>),
    Permission(String),
    AnyPermission(Vec<String>),
    AllPermissions(Vec<String>),
    /// The principal holds `role` and `role` itself carries `permission`
    PermissionOfRole { role: String, permission: String },
}

fn owned<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

pub fn requires_role(role: impl Into<String>) -> Gate {
    Gate::Role(role.into())
}

pub fn requires_any_role<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Gate {
    Gate::AnyRole(owned(roles))
}

pub fn requires_all_roles<I: IntoIterator<Item = S>, S: Into<String>>(roles: I) -> Gate {
    Gate::AllRoles(owned(roles))
}

pub fn requires_permission(permission: impl Into<String>) -> Gate {
    Gate::Permission(permission.into())
}

pub fn requires_any_permission<I: IntoIterator<Item = S>, S: Into<String>>(permissions: I) -> Gate {
    Gate::AnyPermission(owned(permissions))
}

pub fn requires_all_permissions<I: IntoIterator<Item = S>, S: Into<String>>(permissions: I) -> Gate {
    Gate::AllPermissions(owned(permissions))
}

pub fn requires_permission_of_role(role: impl Into<String>, permission: impl Into<String>) -> Gate {
    Gate::PermissionOfRole {
        role: role.into(),
        permission: permission.into(),
    }
}

impl Gate {
    /// `Unauthenticated` without a principal, `InsufficientPermissions` if the principal
    /// lacks the capability.
    #[instrument(skip_all, fields(gate = ?self), err(level = "debug"))]
    pub async fn check(&self, principal: Option<&Principal>, cache: &PermissionCache) -> Result<()> {
        let principal = principal.ok_or(Error::Unauthenticated { message: None })?;
        if self.allows(principal, cache).await? {
            Ok(())
        } else {
            debug!(subject_id = %abbrev_uuid(&principal.id), "Gate denied request");
            Err(Error::InsufficientPermissions)
        }
    }

    async fn allows(&self, principal: &Principal, cache: &PermissionCache) -> Result<bool> {
        let allowed = match self {
            Gate::Role(role) => cache.roles_of(principal.id).await?.contains(role),
            Gate::AnyRole(roles) => {
                let held = cache.roles_of(principal.id).await?;
                roles.iter().any(|r| held.contains(r))
            }
            Gate::AllRoles(roles) => {
                let held = cache.roles_of(principal.id).await?;
                roles.iter().all(|r| held.contains(r))
            }
            Gate::Permission(permission) => any_grants(&cache.permissions_of(principal.id).await?, permission),
            Gate::AnyPermission(permissions) => {
                let held = cache.permissions_of(principal.id).await?;
                permissions.iter().any(|p| any_grants(&held, p))
            }
            Gate::AllPermissions(permissions) => {
                let held = cache.permissions_of(principal.id).await?;
                permissions.iter().all(|p| any_grants(&held, p))
            }
            Gate::PermissionOfRole { role, permission } => {
                if !cache.roles_of(principal.id).await?.contains(role) {
                    return Ok(false);
                }
                match cache.permissions_of_role(role).await? {
                    Some(carried) => any_grants(carried.iter(), permission),
                    None => false,
                }
            }
        };
        Ok(allowed)
    }
}

/// Route layer enforcing `gate`.
///
/// Uses the principal attached by the authentication middleware, authenticating the
/// bearer token itself when none is attached.
pub async fn enforce(State((state, gate)): State<(AppState, Gate)>, mut request: Request, next: Next) -> Result<Response> {
    let principal = match request.extensions().get::<Authenticated>() {
        Some(auth) => auth.principal.clone(),
        None => {
            let auth = authenticate(state.auth.tokens(), request.headers()).await?;
            let principal = auth.principal.clone();
            attach(request.extensions_mut(), auth);
            principal
        }
    };
    gate.check(Some(&principal), state.auth.permissions()).await?;
    Ok(next.run(request).await)
}
