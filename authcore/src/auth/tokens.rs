//! Signed bearer tokens: minting, validation, rotation and revocation.
//!
//! Two token classes are issued, both HS256 JWTs signed with the same secret and told
//! apart by audience:
//!
//! - **access** tokens carry the principal (`sub`, `email`, `username`, `roles`) and are
//!   presented on every request
//! - **refresh** tokens carry only `sub` and `jti`; whoever redeems them must reload the
//!   subject and its roles live
//!
//! Validation runs in a fixed order: signature, `nbf <= now < exp` with no leeway,
//! audience, token blacklist, subject marker. The first failing step decides the
//! [`TokenErrorKind`].
//!
//! Revocation is stored in a [`RevocationStore`]. Without one, revoking fails with
//! [`TokenError::RevocationUnsupported`] and every revocation lookup answers "not revoked".

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind as JwtErrorKind};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::revocation::{RevocationError, RevocationStore};
use crate::config::{MIN_JWT_SECRET_BYTES, PLACEHOLDER_JWT_SECRET, TokenConfig};
use crate::errors::Error;
use crate::types::{SubjectId, abbrev_uuid};

pub const ACCESS_AUDIENCE: &str = "access";
pub const REFRESH_AUDIENCE: &str = "refresh";

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenErrorKind {
    /// Not a JWT, unparseable claims, wrong issuer
    Malformed,
    BadSignature,
    Expired,
    /// `nbf` lies in the future
    NotYetValid,
    /// Access token presented as refresh or the other way round
    WrongAudience,
    /// This exact token was revoked
    Blacklisted,
    /// Every token of the subject issued before a mass invalidation
    SubjectRevoked,
    /// Refresh token redeemed on behalf of a different subject
    SubjectMismatch,
    /// Opaque token that was never issued or has already been used
    Unknown,
}

impl TokenErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TokenErrorKind::Malformed => "malformed",
            TokenErrorKind::BadSignature => "bad_signature",
            TokenErrorKind::Expired => "expired",
            TokenErrorKind::NotYetValid => "not_yet_valid",
            TokenErrorKind::WrongAudience => "wrong_audience",
            TokenErrorKind::Blacklisted => "blacklisted",
            TokenErrorKind::SubjectRevoked => "subject_revoked",
            TokenErrorKind::SubjectMismatch => "subject_mismatch",
            TokenErrorKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token rejected: {}", kind.as_str())]
    Invalid { kind: TokenErrorKind },

    #[error("token revocation is not configured")]
    RevocationUnsupported,

    #[error(transparent)]
    Revocation(#[from] RevocationError),

    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    #[error("signing secret rejected: {0}")]
    WeakSecret(&'static str),
}

impl TokenError {
    fn invalid(kind: TokenErrorKind) -> Self {
        TokenError::Invalid { kind }
    }

    pub fn kind(&self) -> Option<TokenErrorKind> {
        match self {
            TokenError::Invalid { kind } => Some(*kind),
            _ => None,
        }
    }

    fn from_jwt(err: jsonwebtoken::errors::Error) -> Self {
        let kind = match err.kind() {
            JwtErrorKind::InvalidSignature | JwtErrorKind::InvalidAlgorithm | JwtErrorKind::InvalidAlgorithmName => {
                TokenErrorKind::BadSignature
            }
            JwtErrorKind::ExpiredSignature => TokenErrorKind::Expired,
            JwtErrorKind::ImmatureSignature => TokenErrorKind::NotYetValid,
            JwtErrorKind::InvalidAudience => TokenErrorKind::WrongAudience,
            _ => TokenErrorKind::Malformed,
        };
        TokenError::invalid(kind)
    }
}

impl From<TokenError> for Error {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid { kind } => Error::InvalidToken { kind },
            TokenError::RevocationUnsupported => Error::Unsupported {
                operation: "token revocation".to_string(),
            },
            TokenError::Revocation(e) => e.into(),
            TokenError::Signing(e) => Error::Internal {
                operation: format!("sign token: {e}"),
            },
            TokenError::WeakSecret(reason) => Error::Internal {
                operation: format!("load signing secret: {reason}"),
            },
        }
    }
}

/// Claims of an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: SubjectId,
    pub email: String,
    pub username: String,
    pub roles: Vec<String>,
    pub jti: Uuid,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    /// Issue instant in milliseconds, compared against subject markers
    pub iat_ms: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Claims of a refresh token. No principal payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub jti: Uuid,
    pub sub: SubjectId,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub iat_ms: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// The subset every token carries, checked before the full claim set is parsed.
#[derive(Deserialize)]
struct Envelope {
    sub: SubjectId,
    aud: String,
    iat: i64,
    #[serde(default)]
    iat_ms: Option<i64>,
    nbf: i64,
    exp: i64,
}

impl Envelope {
    fn issued_at_ms(&self) -> i64 {
        self.iat_ms.unwrap_or(self.iat.saturating_mul(1000))
    }
}

/// Freshly minted credentials as returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Always `Bearer`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
}

/// Who a token pair is minted for.
#[derive(Debug, Clone, Copy)]
pub struct TokenSubject<'a> {
    pub id: SubjectId,
    pub email: &'a str,
    pub username: &'a str,
    pub roles: &'a [String],
}

fn subject_marker_key(subject_id: SubjectId) -> String {
    format!("subject:{subject_id}")
}

/// Refresh tokens outlive access tokens, so their marker needs its own lifetime.
fn subject_refresh_marker_key(subject_id: SubjectId) -> String {
    format!("subject:{subject_id}:refresh")
}

/// Which tokens of a subject a live marker rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerScope {
    /// Every token, whenever it was issued. Access markers only last one access lifetime
    All,
    /// Tokens issued at or before the marker instant, so a later login can still refresh
    IssuedBefore,
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, TokenError> {
    DateTime::from_timestamp(secs, 0).ok_or(TokenError::invalid(TokenErrorKind::Malformed))
}

fn remaining(exp: i64, now: DateTime<Utc>) -> Duration {
    DateTime::from_timestamp(exp, 0)
        .and_then(|exp| (exp - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

/// Mints, validates and revokes access and refresh tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_lifetime: Duration,
    refresh_lifetime: Duration,
    store: Option<Arc<dyn RevocationStore>>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("issuer", &self.issuer)
            .field("access_lifetime", &self.access_lifetime)
            .field("refresh_lifetime", &self.refresh_lifetime)
            .field("store", &self.store.as_ref().map(|s| s.name()))
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Build the service, refusing short or placeholder secrets.
    pub fn new(config: &TokenConfig, store: Option<Arc<dyn RevocationStore>>) -> Result<Self, TokenError> {
        if config.secret == PLACEHOLDER_JWT_SECRET {
            return Err(TokenError::WeakSecret("placeholder value"));
        }
        if config.secret.len() < MIN_JWT_SECRET_BYTES {
            return Err(TokenError::WeakSecret("shorter than 32 bytes"));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        // Temporal and audience checks are done by hand to keep the validation order fixed
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["sub", "iss", "aud", "iat", "nbf", "exp"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
            access_lifetime: config.access_expiry,
            refresh_lifetime: config.refresh_expiry,
            store,
        })
    }

    pub fn access_lifetime(&self) -> Duration {
        self.access_lifetime
    }

    pub fn refresh_lifetime(&self) -> Duration {
        self.refresh_lifetime
    }

    pub fn revocation_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Mint a new access and refresh token for `subject`.
    pub fn mint_pair(&self, subject: TokenSubject<'_>) -> Result<TokenPair, TokenError> {
        self.mint_pair_at(subject, Utc::now())
    }

    pub(crate) fn mint_pair_at(&self, subject: TokenSubject<'_>, now: DateTime<Utc>) -> Result<TokenPair, TokenError> {
        let iat = now.timestamp();
        let iat_ms = now.timestamp_millis();
        let access = AccessClaims {
            sub: subject.id,
            email: subject.email.to_string(),
            username: subject.username.to_string(),
            roles: subject.roles.to_vec(),
            jti: Uuid::new_v4(),
            iss: self.issuer.clone(),
            aud: ACCESS_AUDIENCE.to_string(),
            iat,
            iat_ms,
            nbf: iat,
            exp: iat + self.access_lifetime.as_secs() as i64,
        };
        let refresh = RefreshClaims {
            jti: Uuid::new_v4(),
            sub: subject.id,
            iss: self.issuer.clone(),
            aud: REFRESH_AUDIENCE.to_string(),
            iat,
            iat_ms,
            nbf: iat,
            exp: iat + self.refresh_lifetime.as_secs() as i64,
        };

        let header = Header::new(Algorithm::HS256);
        let access_token = encode(&header, &access, &self.encoding_key).map_err(TokenError::Signing)?;
        let refresh_token = encode(&header, &refresh, &self.encoding_key).map_err(TokenError::Signing)?;

        debug!(subject_id = %abbrev_uuid(&subject.id), "Minted token pair");
        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.access_lifetime.as_secs(),
            refresh_expires_in: self.refresh_lifetime.as_secs(),
        })
    }

    /// Signature, temporal and audience checks. No store lookups.
    fn verify<C: DeserializeOwned>(&self, token: &str, audience: &str, now: DateTime<Utc>) -> Result<(C, Envelope), TokenError> {
        let data = decode::<serde_json::Value>(token, &self.decoding_key, &self.validation).map_err(TokenError::from_jwt)?;
        let envelope: Envelope =
            serde_json::from_value(data.claims.clone()).map_err(|_| TokenError::invalid(TokenErrorKind::Malformed))?;

        if now < timestamp(envelope.nbf)? {
            return Err(TokenError::invalid(TokenErrorKind::NotYetValid));
        }
        if now >= timestamp(envelope.exp)? {
            return Err(TokenError::invalid(TokenErrorKind::Expired));
        }
        if envelope.aud != audience {
            return Err(TokenError::invalid(TokenErrorKind::WrongAudience));
        }

        let claims = serde_json::from_value(data.claims).map_err(|_| TokenError::invalid(TokenErrorKind::Malformed))?;
        Ok((claims, envelope))
    }

    /// Revocation checks shared by both token classes.
    async fn check_revocation(&self, token: &str, envelope: &Envelope, marker_key: String, scope: MarkerScope) -> Result<(), TokenError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        if store.get(token).await?.is_some() {
            return Err(TokenError::invalid(TokenErrorKind::Blacklisted));
        }
        if let Some(revoked_at) = store.get(&marker_key).await? {
            match (scope, revoked_at.parse::<i64>()) {
                (MarkerScope::IssuedBefore, Ok(revoked_at)) if envelope.issued_at_ms() > revoked_at => {}
                _ => return Err(TokenError::invalid(TokenErrorKind::SubjectRevoked)),
            }
        }
        Ok(())
    }

    fn record_failure<T>(result: Result<T, TokenError>, audience: &'static str) -> Result<T, TokenError> {
        if let Err(TokenError::Invalid { kind }) = &result {
            metrics::counter!("authcore_token_rejections_total", "audience" => audience, "kind" => kind.as_str()).increment(1);
        }
        result
    }

    /// Validate an access token and return its claims.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn validate_access(&self, token: &str) -> Result<AccessClaims, TokenError> {
        self.validate_access_at(token, Utc::now()).await
    }

    pub(crate) async fn validate_access_at(&self, token: &str, now: DateTime<Utc>) -> Result<AccessClaims, TokenError> {
        let result = async {
            let (claims, envelope) = self.verify::<AccessClaims>(token, ACCESS_AUDIENCE, now)?;
            self.check_revocation(token, &envelope, subject_marker_key(envelope.sub), MarkerScope::All)
                .await?;
            Ok(claims)
        }
        .await;
        Self::record_failure(result, ACCESS_AUDIENCE)
    }

    /// Signature, expiry and audience only. Used where a store round trip is not worth it,
    /// such as picking a rate-limit key.
    pub fn peek_access_subject(&self, token: &str) -> Option<SubjectId> {
        self.verify::<AccessClaims>(token, ACCESS_AUDIENCE, Utc::now())
            .ok()
            .map(|(claims, _)| claims.sub)
    }

    /// Validate a refresh token and return its claims.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn validate_refresh(&self, token: &str) -> Result<RefreshClaims, TokenError> {
        self.validate_refresh_at(token, Utc::now()).await
    }

    pub(crate) async fn validate_refresh_at(&self, token: &str, now: DateTime<Utc>) -> Result<RefreshClaims, TokenError> {
        let result = async {
            let (claims, envelope) = self.verify::<RefreshClaims>(token, REFRESH_AUDIENCE, now)?;
            self.check_revocation(
                token,
                &envelope,
                subject_refresh_marker_key(envelope.sub),
                MarkerScope::IssuedBefore,
            )
            .await?;
            Ok(claims)
        }
        .await;
        Self::record_failure(result, REFRESH_AUDIENCE)
    }

    /// Exchange a refresh token for a new pair, consuming the presented token.
    ///
    /// The presented token is blacklisted for the rest of its lifetime before the new pair
    /// is minted. If the blacklist write fails the rotation still succeeds; the old token
    /// then stays usable until its own expiry at most.
    #[instrument(skip_all, fields(subject_id = %abbrev_uuid(&subject.id)), err(level = "debug"))]
    pub async fn rotate(&self, refresh_token: &str, subject: TokenSubject<'_>) -> Result<TokenPair, TokenError> {
        self.rotate_at(refresh_token, subject, Utc::now()).await
    }

    pub(crate) async fn rotate_at(&self, refresh_token: &str, subject: TokenSubject<'_>, now: DateTime<Utc>) -> Result<TokenPair, TokenError> {
        let claims = self.validate_refresh_at(refresh_token, now).await?;
        if claims.sub != subject.id {
            return Err(TokenError::invalid(TokenErrorKind::SubjectMismatch));
        }

        if let Some(store) = &self.store {
            let ttl = remaining(claims.exp, now);
            match store.put_if_absent(refresh_token, &claims.jti.to_string(), ttl).await {
                Ok(true) => {}
                // A concurrent rotation consumed it first
                Ok(false) => return Err(TokenError::invalid(TokenErrorKind::Blacklisted)),
                Err(e) => warn!(error = %e, "Failed to blacklist rotated refresh token, continuing"),
            }
        }

        self.mint_pair_at(subject, now)
    }

    /// Blacklist a single token (either class) for its remaining lifetime.
    ///
    /// Tokens that fail signature checks or have already expired are accepted silently:
    /// there is nothing left to revoke.
    #[instrument(skip_all, err)]
    pub async fn revoke(&self, token: &str) -> Result<(), TokenError> {
        let store = self.store.as_ref().ok_or(TokenError::RevocationUnsupported)?;
        let now = Utc::now();
        let data = match decode::<serde_json::Value>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data,
            Err(_) => return Ok(()),
        };
        let Ok(envelope) = serde_json::from_value::<Envelope>(data.claims) else {
            return Ok(());
        };
        let ttl = remaining(envelope.exp, now);
        if ttl.is_zero() {
            return Ok(());
        }
        store.put(token, "revoked", ttl).await?;
        debug!(subject_id = %abbrev_uuid(&envelope.sub), "Revoked token");
        Ok(())
    }

    /// Mass invalidation of `subject_id`.
    ///
    /// Every access token of the subject is rejected for one access-token lifetime,
    /// including tokens minted after this call. Refresh tokens issued up to now are
    /// rejected for one refresh lifetime; refresh tokens from a later login stay usable.
    #[instrument(skip_all, fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn revoke_subject(&self, subject_id: SubjectId) -> Result<(), TokenError> {
        self.revoke_subject_at(subject_id, Utc::now()).await
    }

    pub(crate) async fn revoke_subject_at(&self, subject_id: SubjectId, now: DateTime<Utc>) -> Result<(), TokenError> {
        let store = self.store.as_ref().ok_or(TokenError::RevocationUnsupported)?;
        let revoked_at = now.timestamp_millis().to_string();
        store.put(&subject_marker_key(subject_id), &revoked_at, self.access_lifetime).await?;
        store
            .put(&subject_refresh_marker_key(subject_id), &revoked_at, self.refresh_lifetime)
            .await?;
        metrics::counter!("authcore_subject_revocations_total").increment(1);
        Ok(())
    }

    /// Whether `token` itself is blacklisted. `false` when no store is configured.
    pub async fn is_revoked(&self, token: &str) -> Result<bool, TokenError> {
        match &self.store {
            Some(store) => Ok(store.get(token).await?.is_some()),
            None => Ok(false),
        }
    }

    /// Whether a mass-invalidation marker is live for `subject_id`, that is whether
    /// [`Self::validate_access`] currently rejects every access token of the subject.
    /// `false` when no store is configured.
    pub async fn is_subject_revoked(&self, subject_id: SubjectId) -> Result<bool, TokenError> {
        match &self.store {
            Some(store) => Ok(store.get(&subject_marker_key(subject_id)).await?.is_some()),
            None => Ok(false),
        }
    }
}
