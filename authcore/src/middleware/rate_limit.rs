use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{HeaderMap, Extensions, request::Parts},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::AppState;
use crate::auth::principal::bearer_token;
use crate::errors::Error;
use crate::limits::RateLimitKey;

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Network address of the caller.
///
/// The socket peer address, or the first `X-Forwarded-For` entry when the deployment
/// trusts its proxy. `None` when neither is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddress(pub Option<IpAddr>);

impl ClientAddress {
    pub fn resolve(headers: &HeaderMap, extensions: &Extensions, trust_forwarded: bool) -> Self {
        if trust_forwarded {
            let forwarded = headers
                .get(FORWARDED_FOR)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .and_then(|first| first.trim().parse::<IpAddr>().ok());
            if forwarded.is_some() {
                return Self(forwarded);
            }
        }
        Self(extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| addr.ip()))
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{addr}"),
            None => f.write_str("unknown"),
        }
    }
}

impl FromRequestParts<AppState> for ClientAddress {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(Self::resolve(
            &parts.headers,
            &parts.extensions,
            state.config.rate_limit.trust_forwarded_headers,
        ))
    }
}

/// Charge the request to the bearer's subject, or to the client address when anonymous.
///
/// The token is only decoded here, not validated: a forged subject id only spends that
/// subject's budget, and authentication still rejects it later.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Result<Response, Error> {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return Ok(next.run(request).await);
    };

    let subject = bearer_token(request.headers())
        .ok()
        .flatten()
        .and_then(|token| state.auth.tokens().peek_access_subject(token));
    let key = match subject {
        Some(id) => RateLimitKey::Subject(id),
        None => match ClientAddress::resolve(request.headers(), request.extensions(), limiter.trusts_forwarded_headers()).0 {
            Some(addr) => RateLimitKey::Address(addr),
            None => RateLimitKey::Unidentified,
        },
    };

    limiter.check(&key).await?;
    Ok(next.run(request).await)
}

/// Charge a login or password reset attempt to the caller's address, whoever the
/// attempt targets.
pub async fn charge_auth_attempt(state: &AppState, source: ClientAddress) -> Result<(), Error> {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return Ok(());
    };
    let key = source.0.map_or(RateLimitKey::Unidentified, RateLimitKey::Address);
    limiter.check_auth_attempt(&key).await
}
