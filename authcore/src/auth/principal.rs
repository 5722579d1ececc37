//! The authenticated caller, as seen by handlers.
//!
//! [`Authenticated`] is placed in the request extensions by
//! [`require_auth`](crate::auth::middleware::require_auth) or
//! [`optional_auth`](crate::auth::middleware::optional_auth). Handlers take [`Principal`],
//! [`Authenticated`] or [`OptionalPrincipal`]; on routes without the middleware the
//! extractors authenticate the bearer token themselves.

use axum::{
    extract::{FromRequestParts, OptionalFromRequestParts},
    http::{HeaderMap, header, request::Parts},
};
use serde::Serialize;
use std::convert::Infallible;
use tracing::{debug, instrument};
use utoipa::ToSchema;

use crate::AppState;
use crate::auth::tokens::{AccessClaims, TokenService};
use crate::errors::{Error, Result};
use crate::middleware::PrincipalSlot;
use crate::types::{SubjectId, abbrev_uuid};

/// Identity and roles carried by a validated access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Principal {
    #[schema(value_type = String, format = "uuid")]
    pub id: SubjectId,
    pub email: String,
    pub username: String,
    pub roles: Vec<String>,
}

impl From<&AccessClaims> for Principal {
    fn from(claims: &AccessClaims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email.clone(),
            username: claims.username.clone(),
            roles: claims.roles.clone(),
        }
    }
}

/// A principal together with the token that authenticated it.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    pub claims: AccessClaims,
    pub token: String,
}

/// Extract the token from `Authorization: Bearer <token>`.
///
/// `Ok(None)` when there is no header at all.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| Error::InvalidAuthFormat)?;
    let (scheme, token) = value.trim().split_once(' ').ok_or(Error::InvalidAuthFormat)?;
    let token = token.trim();
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() || token.contains(' ') {
        return Err(Error::InvalidAuthFormat);
    }
    Ok(Some(token))
}

/// Validate the bearer token in `headers` as an access token.
#[instrument(skip_all, err(level = "debug"))]
pub async fn authenticate(tokens: &TokenService, headers: &HeaderMap) -> Result<Authenticated> {
    let token = bearer_token(headers)?.ok_or(Error::MissingAuthHeader)?;
    let claims = tokens.validate_access(token).await.inspect_err(|e| {
        if let Some(kind) = e.kind() {
            metrics::counter!("authcore_token_validation_failures_total", "kind" => kind.as_str()).increment(1);
        }
    })?;
    debug!(subject_id = %abbrev_uuid(&claims.sub), "Authenticated bearer token");
    Ok(Authenticated {
        principal: Principal::from(&claims),
        claims,
        token: token.to_string(),
    })
}

/// Record `auth` on the request so later extractors and the access log see it.
pub fn attach(parts_extensions: &mut axum::http::Extensions, auth: Authenticated) {
    if let Some(slot) = parts_extensions.get::<PrincipalSlot>() {
        slot.fill(auth.principal.id);
    }
    parts_extensions.insert(auth);
}

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        if let Some(auth) = parts.extensions.get::<Authenticated>() {
            return Ok(auth.clone());
        }
        let auth = authenticate(state.auth.tokens(), &parts.headers).await?;
        attach(&mut parts.extensions, auth.clone());
        Ok(auth)
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        Ok(Authenticated::from_request_parts(parts, state).await?.principal)
    }
}

impl OptionalFromRequestParts<AppState> for Principal {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Option<Self>, Infallible> {
        Ok(OptionalPrincipal::from_request_parts(parts, state).await?.0)
    }
}

/// The principal if the request carries a valid bearer token, otherwise `None`.
#[derive(Debug, Clone)]
pub struct OptionalPrincipal(pub Option<Principal>);

impl FromRequestParts<AppState> for OptionalPrincipal {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> std::result::Result<Self, Infallible> {
        match <Authenticated as FromRequestParts<AppState>>::from_request_parts(parts, state).await {
            Ok(auth) => Ok(Self(Some(auth.principal))),
            Err(e) => {
                debug!(error = %e, "Continuing without principal");
                Ok(Self(None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token(&HeaderMap::new()).unwrap(), None);
        assert_eq!(bearer_token(&headers("Bearer abc.def.ghi")).unwrap(), Some("abc.def.ghi"));
        assert_eq!(bearer_token(&headers("bearer abc")).unwrap(), Some("abc"));

        for malformed in ["Basic dXNlcjpwYXNz", "Bearer", "Bearer ", "abc", "Bearer a b"] {
            assert!(
                matches!(bearer_token(&headers(malformed)), Err(Error::InvalidAuthFormat)),
                "{malformed} should be rejected"
            );
        }
    }

    #[test]
    fn test_attach_fills_slot() {
        let mut extensions = axum::http::Extensions::new();
        let slot = PrincipalSlot::default();
        extensions.insert(slot.clone());

        let id = uuid::Uuid::new_v4();
        let claims = AccessClaims {
            sub: id,
            email: "a@example.com".into(),
            username: "alice".into(),
            roles: vec!["user".into()],
            jti: uuid::Uuid::new_v4(),
            iss: "authcore".into(),
            aud: "access".into(),
            iat: 0,
            iat_ms: 0,
            nbf: 0,
            exp: 0,
        };
        attach(
            &mut extensions,
            Authenticated {
                principal: Principal::from(&claims),
                claims,
                token: "t".into(),
            },
        );
        assert_eq!(slot.get(), Some(id));
        assert_eq!(extensions.get::<Authenticated>().unwrap().principal.id, id);
    }
}
