//! Authentication service: registration, login, session refresh and password lifecycle.
//!
//! Composes the identity store, password service, token service, permission cache,
//! reset-token store and login throttle. Every operation returns [`crate::errors::Error`]
//! so HTTP handlers can hand results straight back.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

use crate::auth::{
    lockout::LoginThrottle,
    password::{PasswordContext, PasswordService},
    permission_cache::PermissionCache,
    reset_tokens::{ResetTokenRecord, ResetTokenStore},
    tokens::{AccessClaims, TokenError, TokenPair, TokenService, TokenSubject},
};
use crate::config::AuthConfig;
use crate::db::errors::DbError;
use crate::email::ResetNotifier;
use crate::errors::{Error, FieldErrors, Result};
use crate::identity::{IdentityStore, NewSubject, Subject, SubjectUpdate, SubjectView};
use crate::types::{SubjectId, abbrev_uuid, is_plausible_email, is_valid_username, normalize_email};

/// Input to [`AuthService::create_subject`].
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateSubject {
    pub email: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
}

/// Tokens plus the subject they were minted for.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub tokens: TokenPair,
    pub user: SubjectView,
    pub roles: Vec<String>,
}

/// The calling subject with live authorization data.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MeResponse {
    #[serde(flatten)]
    pub user: SubjectView,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
}

#[derive(Clone, bon::Builder)]
pub struct AuthService {
    identity: Arc<dyn IdentityStore>,
    passwords: PasswordService,
    tokens: TokenService,
    permissions: Arc<PermissionCache>,
    reset_tokens: ResetTokenStore,
    throttle: Arc<LoginThrottle>,
    notifier: Option<Arc<dyn ResetNotifier>>,
    config: AuthConfig,
}

fn token_subject<'a>(subject: &'a Subject, roles: &'a [String]) -> TokenSubject<'a> {
    TokenSubject {
        id: subject.id,
        email: &subject.email,
        username: &subject.username,
        roles,
    }
}

/// Map a store uniqueness failure on subjects to a conflict naming the field.
fn conflict_from(err: DbError) -> Error {
    match &err {
        DbError::UniqueViolation { constraint, .. } => {
            let message = match constraint.as_deref() {
                Some(c) if c.contains("email") => "An account with this email address already exists",
                Some(c) if c.contains("username") => "This username is already taken",
                _ => "Account already exists",
            };
            Error::Conflict {
                message: message.to_string(),
            }
        }
        _ => Error::Database(err),
    }
}

/// Revocation is optional; a deployment without a store just skips it.
fn allow_unsupported(result: std::result::Result<(), TokenError>, action: &str) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(TokenError::RevocationUnsupported) => {
            warn!(action, "Token revocation not configured, skipping");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

impl AuthService {
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn permissions(&self) -> &Arc<PermissionCache> {
        &self.permissions
    }

    pub fn identity(&self) -> &Arc<dyn IdentityStore> {
        &self.identity
    }

    pub fn passwords(&self) -> &PasswordService {
        &self.passwords
    }

    pub fn throttle(&self) -> &Arc<LoginThrottle> {
        &self.throttle
    }

    pub fn reset_tokens(&self) -> &ResetTokenStore {
        &self.reset_tokens
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Register a subject with the configured default role.
    #[instrument(skip_all, fields(username = %request.username), err)]
    pub async fn create_subject(&self, request: CreateSubject) -> Result<SubjectView> {
        self.create_subject_with_roles(request, std::slice::from_ref(&self.config.default_role))
            .await
    }

    /// Register a subject with an explicit initial role set.
    pub async fn create_subject_with_roles(&self, request: CreateSubject, roles: &[String]) -> Result<SubjectView> {
        let email = normalize_email(&request.email);
        let username = request.username.trim().to_string();

        let mut details = FieldErrors::new();
        if !is_plausible_email(&email) {
            details.entry("email".to_string()).or_default().push("invalid_format".to_string());
        }
        if !is_valid_username(&username) {
            details.entry("username".to_string()).or_default().push("invalid_format".to_string());
        }
        let context = PasswordContext {
            email: Some(&email),
            username: Some(&username),
        };
        if let Err(e) = self.passwords.validate(&request.password, Some(context)) {
            match e.into_field_error("password") {
                Error::Validation { details: password, .. } => details.extend(password),
                other => return Err(other),
            }
        }
        if !details.is_empty() {
            return Err(Error::Validation {
                message: "Invalid registration request".to_string(),
                details,
            });
        }

        if self.identity.exists_by_email(&email).await? {
            return Err(Error::Conflict {
                message: "An account with this email address already exists".to_string(),
            });
        }
        if self.identity.exists_by_username(&username).await? {
            return Err(Error::Conflict {
                message: "This username is already taken".to_string(),
            });
        }

        let password_digest = self.passwords.hash_async(request.password).await?;
        let new = NewSubject {
            email,
            username,
            password_digest,
            display_name: request.display_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
        };
        let subject = self.identity.create(new, roles).await.map_err(|e| match e {
            DbError::NotFound => Error::Internal {
                operation: "assign initial roles: role missing from catalog".to_string(),
            },
            other => conflict_from(other),
        })?;

        info!(subject_id = %abbrev_uuid(&subject.id), "Created subject");
        Ok(subject.into())
    }

    /// Authenticate with email and password.
    ///
    /// Unknown email, inactive subject and wrong password all produce
    /// [`Error::InvalidCredentials`] after a full password verification. `source` is the
    /// client address used to count failures.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn login(&self, email: &str, password: &str, source: &str) -> Result<LoginResponse> {
        let email = normalize_email(email);
        let subject = self.identity.get_by_email(&email).await?;

        if let Some(subject) = &subject {
            self.throttle.ensure_unlocked(subject.id).await?;
        }

        let digest = subject.as_ref().map(|s| s.password_digest.clone());
        let verified = self.passwords.verify_async(password.to_string(), digest).await?;

        let subject = match subject {
            Some(subject) if verified && subject.active => subject,
            other => {
                let subject_id = other.as_ref().map(|s| s.id);
                if self.throttle.record_failure(source, &email, subject_id).await {
                    debug!("Failed login locked the account");
                }
                return Err(Error::InvalidCredentials);
            }
        };
        self.throttle.record_success(source, &email);

        // Live, not cached: a role change must not be missed at login
        let roles = self.identity.roles_of_subject(subject.id).await?;

        let identity = self.identity.clone();
        let subject_id = subject.id;
        tokio::spawn(async move {
            if let Err(e) = identity.update_last_login(subject_id).await {
                warn!(error = %e, subject_id = %abbrev_uuid(&subject_id), "Failed to record last login");
            }
        });

        let tokens = self.tokens.mint_pair(token_subject(&subject, &roles))?;
        info!(subject_id = %abbrev_uuid(&subject.id), "Login succeeded");
        Ok(LoginResponse {
            tokens,
            user: subject.into(),
            roles,
        })
    }

    /// Lock the account behind `email`, if there is one, after its source ran out of
    /// authentication attempts. Unknown emails and store failures are ignored.
    pub async fn lock_account(&self, email: &str) {
        if !self.throttle.enabled() {
            return;
        }
        match self.identity.get_by_email(&normalize_email(email)).await {
            Ok(Some(subject)) => self.throttle.lock(subject.id).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to look up account to lock"),
        }
    }

    /// Revoke the presented access token and, if given, a refresh token of the same subject.
    ///
    /// With `auth.sessions.logout_all_sessions` every token of the subject is invalidated.
    #[instrument(skip_all, fields(subject_id = %abbrev_uuid(&claims.sub)), err)]
    pub async fn logout(&self, access_token: &str, claims: &AccessClaims, refresh_token: Option<&str>) -> Result<()> {
        allow_unsupported(self.tokens.revoke(access_token).await, "logout")?;

        if let Some(refresh_token) = refresh_token {
            match self.tokens.validate_refresh(refresh_token).await {
                Ok(refresh) if refresh.sub == claims.sub => {
                    allow_unsupported(self.tokens.revoke(refresh_token).await, "logout")?;
                }
                Ok(_) => warn!("Refresh token presented at logout belongs to another subject, ignoring"),
                Err(e) => debug!(error = %e, "Refresh token presented at logout already unusable"),
            }
        }

        if self.config.sessions.logout_all_sessions {
            allow_unsupported(self.tokens.revoke_subject(claims.sub).await, "logout everywhere")?;
        }
        Ok(())
    }

    /// Exchange a refresh token for a new pair, reloading the subject and roles live.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.tokens.validate_refresh(refresh_token).await?;
        let subject = self
            .identity
            .get_by_id(claims.sub)
            .await?
            .filter(|s| s.active)
            .ok_or(Error::Unauthenticated { message: None })?;
        let roles = self.identity.roles_of_subject(subject.id).await?;
        Ok(self.tokens.rotate(refresh_token, token_subject(&subject, &roles)).await?)
    }

    async fn active_subject(&self, subject_id: SubjectId) -> Result<Subject> {
        self.identity
            .get_by_id(subject_id)
            .await?
            .filter(|s| s.active)
            .ok_or(Error::Unauthenticated { message: None })
    }

    async fn store_new_password(&self, subject: &Subject, new_password: String) -> Result<()> {
        let digest = self.passwords.hash_async(new_password).await?;
        self.identity
            .update(
                subject.id,
                SubjectUpdate {
                    password_digest: Some(digest),
                    ..Default::default()
                },
            )
            .await?;
        if self.config.sessions.revoke_on_password_change {
            allow_unsupported(self.tokens.revoke_subject(subject.id).await, "revoke sessions on password change")?;
        }
        Ok(())
    }

    fn check_new_password(&self, subject: &Subject, new_password: &str) -> Result<()> {
        let context = PasswordContext {
            email: Some(&subject.email),
            username: Some(&subject.username),
        };
        self.passwords
            .validate(new_password, Some(context))
            .map_err(|e| e.into_field_error("new_password"))
    }

    #[instrument(skip_all, fields(subject_id = %abbrev_uuid(&subject_id)), err)]
    pub async fn change_password(&self, subject_id: SubjectId, current_password: &str, new_password: &str) -> Result<()> {
        let subject = self.active_subject(subject_id).await?;

        let verified = self
            .passwords
            .verify_async(current_password.to_string(), Some(subject.password_digest.clone()))
            .await?;
        if !verified {
            return Err(Error::validation("current_password", "incorrect"));
        }
        self.check_new_password(&subject, new_password)?;
        if new_password == current_password {
            return Err(Error::validation("new_password", "same_as_current"));
        }

        self.store_new_password(&subject, new_password.to_string()).await?;
        info!("Password changed");
        Ok(())
    }

    /// Start a password reset. Always succeeds and always takes at least the configured
    /// minimum duration, whether or not the email belongs to an eligible subject.
    #[instrument(skip_all)]
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let started = Instant::now();
        if let Err(e) = self.issue_reset_token(email).await {
            warn!(error = %e, "Failed to issue reset token");
        }
        let floor = self.config.forgot_password_min_duration;
        if let Some(remaining) = floor.checked_sub(started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
        Ok(())
    }

    async fn issue_reset_token(&self, email: &str) -> Result<()> {
        let email = normalize_email(email);
        let Some(subject) = self.identity.get_by_email(&email).await?.filter(|s| s.active) else {
            debug!("Reset requested for ineligible email");
            return Ok(());
        };

        let ttl = self.config.reset_token_expiry.min(Duration::from_secs(3600));
        let token = self.passwords.mint_reset_token()?;
        let record = ResetTokenRecord::new(subject.id, ttl);
        self.reset_tokens.store(&token, &record, ttl).await?;

        match &self.notifier {
            Some(notifier) => {
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier
                        .send_password_reset(&subject.email, subject.display_name.as_deref(), &token, ttl)
                        .await
                    {
                        warn!(error = %e, subject_id = %abbrev_uuid(&subject.id), "Failed to send reset email");
                    }
                });
            }
            None => warn!("No reset notifier configured, reset token not delivered"),
        }
        Ok(())
    }

    /// Redeem a reset token. Each token works once.
    #[instrument(skip_all, err(level = "debug"))]
    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<()> {
        let record = self.reset_tokens.fetch(token).await?;
        let subject = self.active_subject(record.subject_id).await.map_err(|_| Error::InvalidToken {
            kind: crate::auth::tokens::TokenErrorKind::Unknown,
        })?;
        // Validate before consuming so a weak password does not burn the token
        self.check_new_password(&subject, new_password)?;

        let consumed = self.reset_tokens.consume(token).await?;
        if consumed.subject_id != subject.id {
            return Err(Error::Internal {
                operation: "redeem reset token: record changed during reset".to_string(),
            });
        }

        self.store_new_password(&subject, new_password.to_string()).await?;
        info!(subject_id = %abbrev_uuid(&subject.id), "Password reset");
        Ok(())
    }

    /// The calling subject with roles and permissions from the permission cache.
    pub async fn me(&self, subject_id: SubjectId) -> Result<MeResponse> {
        let subject = self.identity.get_by_id(subject_id).await?.ok_or_else(|| Error::NotFound {
            resource: "Subject".to_string(),
            id: subject_id.to_string(),
        })?;
        let authorization = self.permissions.authorization(subject_id).await?;
        Ok(MeResponse {
            user: subject.into(),
            roles: authorization.roles.clone(),
            permissions: authorization.permissions.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::TokenErrorKind;
    use crate::test_utils::{TestServices, create_test_config, create_test_services};

    const PASSWORD: &str = "P@ssw0rd!";

    async fn services() -> TestServices {
        create_test_services(&create_test_config()).await
    }

    fn register(email: &str, username: &str) -> CreateSubject {
        CreateSubject {
            email: email.to_string(),
            username: username.to_string(),
            password: PASSWORD.to_string(),
            display_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_subject_assigns_default_role() {
        let s = services().await;
        let view = s.auth.create_subject(register("  User1@Example.com ", "user1")).await.unwrap();
        assert_eq!(view.email, "user1@example.com");
        assert!(view.active);
        assert!(!view.verified);
        assert_eq!(s.identity.roles_of_subject(view.id).await.unwrap(), vec!["user"]);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("password_digest").is_none());
    }

    #[tokio::test]
    async fn test_create_subject_conflicts() {
        let s = services().await;
        s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();

        let dup_email = s.auth.create_subject(register("USER1@example.com", "other")).await;
        assert!(matches!(dup_email, Err(Error::Conflict { .. })));
        let dup_username = s.auth.create_subject(register("other@example.com", "User1")).await;
        assert!(matches!(dup_username, Err(Error::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_create_subject_reports_all_field_errors() {
        let s = services().await;
        let result = s
            .auth
            .create_subject(CreateSubject {
                email: "not-an-email".into(),
                username: "x".into(),
                password: "short".into(),
                display_name: None,
            })
            .await;
        match result {
            Err(Error::Validation { details, .. }) => {
                assert_eq!(details["email"], vec!["invalid_format"]);
                assert_eq!(details["username"], vec!["invalid_format"]);
                assert!(details["password"].contains(&"too_short".to_string()));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_login_and_me() {
        let s = services().await;
        let view = s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();

        let login = s.auth.login("USER1@example.com", PASSWORD, "203.0.113.7").await.unwrap();
        assert_eq!(login.user.id, view.id);
        assert_eq!(login.roles, vec!["user"]);
        assert_eq!(login.tokens.expires_in, 900);

        let claims = s.auth.tokens().validate_access(&login.tokens.access_token).await.unwrap();
        assert_eq!(claims.sub, view.id);
        assert_eq!(claims.roles, vec!["user"]);

        let me = s.auth.me(view.id).await.unwrap();
        assert_eq!(me.roles, vec!["user"]);
        assert!(me.permissions.contains(&"products.read".to_string()));
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let s = services().await;
        s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();
        s.auth.create_subject(register("inactive@example.com", "inactive")).await.unwrap();
        let inactive = s.identity.get_by_email("inactive@example.com").await.unwrap().unwrap();
        s.identity.delete(inactive.id).await.unwrap();

        let ghost = s.auth.login("ghost@example.com", "anything", "src").await.unwrap_err();
        let wrong = s.auth.login("user1@example.com", "wrong", "src").await.unwrap_err();
        let disabled = s.auth.login("inactive@example.com", PASSWORD, "src").await.unwrap_err();

        for err in [&ghost, &wrong, &disabled] {
            assert!(matches!(err, Error::InvalidCredentials));
        }
        let bodies: Vec<_> = [ghost, wrong, disabled]
            .iter()
            .map(|e| (e.status_code(), e.code(), e.user_message()))
            .collect();
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        assert!(s.auth.login("user1@example.com", PASSWORD, "src").await.is_ok());
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures() {
        let s = services().await;
        s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();

        for _ in 0..5 {
            let err = s.auth.login("user1@example.com", "wrong", "203.0.113.7").await.unwrap_err();
            assert!(matches!(err, Error::InvalidCredentials));
        }
        let err = s.auth.login("user1@example.com", PASSWORD, "203.0.113.7").await.unwrap_err();
        match err {
            Error::AccountLocked { retry_after } => assert!(retry_after > Duration::from_secs(0)),
            other => panic!("expected lockout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_rotates_and_rejects_reuse() {
        let s = services().await;
        s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();
        let login = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();

        let rotated = s.auth.refresh(&login.tokens.refresh_token).await.unwrap();
        assert_ne!(rotated.refresh_token, login.tokens.refresh_token);

        match s.auth.refresh(&login.tokens.refresh_token).await {
            Err(Error::InvalidToken { kind }) => assert_eq!(kind, TokenErrorKind::Blacklisted),
            other => panic!("expected blacklisted, got {other:?}"),
        }
        // Access tokens are not rotated away
        assert!(s.auth.tokens().validate_access(&login.tokens.access_token).await.is_ok());
        assert!(s.auth.tokens().validate_access(&rotated.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_refresh_rejects_deactivated_subject() {
        let s = services().await;
        let view = s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();
        let login = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();
        s.identity.delete(view.id).await.unwrap();
        assert!(matches!(
            s.auth.refresh(&login.tokens.refresh_token).await,
            Err(Error::Unauthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_logout_revokes_presented_tokens_only() {
        let s = services().await;
        s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();
        let first = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();
        let second = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();

        let claims = s.auth.tokens().validate_access(&first.tokens.access_token).await.unwrap();
        s.auth
            .logout(&first.tokens.access_token, &claims, Some(&first.tokens.refresh_token))
            .await
            .unwrap();

        assert!(s.auth.tokens().validate_access(&first.tokens.access_token).await.is_err());
        assert!(s.auth.refresh(&first.tokens.refresh_token).await.is_err());
        assert!(s.auth.tokens().validate_access(&second.tokens.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_logout_everywhere_policy() {
        let mut config = create_test_config();
        config.auth.sessions.logout_all_sessions = true;
        let s = create_test_services(&config).await;
        s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();
        let first = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();
        let second = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();

        let claims = s.auth.tokens().validate_access(&first.tokens.access_token).await.unwrap();
        s.auth.logout(&first.tokens.access_token, &claims, None).await.unwrap();

        match s.auth.tokens().validate_access(&second.tokens.access_token).await {
            Err(TokenError::Invalid { kind }) => assert_eq!(kind, TokenErrorKind::SubjectRevoked),
            other => panic!("expected subject revoked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_change_password() {
        let s = services().await;
        let view = s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();

        let wrong = s.auth.change_password(view.id, "wrong", "N3wP@ssword!").await.unwrap_err();
        assert!(matches!(wrong, Error::Validation { ref details, .. } if details.contains_key("current_password")));

        let same = s.auth.change_password(view.id, PASSWORD, PASSWORD).await.unwrap_err();
        assert!(matches!(same, Error::Validation { ref details, .. } if details.contains_key("new_password")));

        let weak = s.auth.change_password(view.id, PASSWORD, "weak").await.unwrap_err();
        assert!(matches!(weak, Error::Validation { ref details, .. } if details.contains_key("new_password")));

        let before = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();
        s.auth.change_password(view.id, PASSWORD, "N3wP@ssword!").await.unwrap();
        assert!(s.auth.login("user1@example.com", PASSWORD, "src").await.is_err());
        assert!(s.auth.login("user1@example.com", "N3wP@ssword!", "src").await.is_ok());

        // Sessions survive by default
        assert!(s.auth.tokens().validate_access(&before.tokens.access_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_password_can_revoke_sessions() {
        let mut config = create_test_config();
        config.auth.sessions.revoke_on_password_change = true;
        let s = create_test_services(&config).await;
        let view = s.auth.create_subject(register("user1@example.com", "user1")).await.unwrap();
        let before = s.auth.login("user1@example.com", PASSWORD, "src").await.unwrap();

        s.auth.change_password(view.id, PASSWORD, "N3wP@ssword!").await.unwrap();
        assert!(s.auth.tokens().validate_access(&before.tokens.access_token).await.is_err());

        // A fresh login gets a refresh token that survives the marker, while access
        // tokens stay rejected until the marker runs out
        tokio::time::sleep(Duration::from_millis(2)).await;
        let after = s.auth.login("user1@example.com", "N3wP@ssword!", "src").await.unwrap();
        match s.auth.tokens().validate_access(&after.tokens.access_token).await {
            Err(TokenError::Invalid { kind }) => assert_eq!(kind, TokenErrorKind::SubjectRevoked),
            other => panic!("expected subject revoked, got {other:?}"),
        }
        assert!(s.auth.tokens().validate_refresh(&after.tokens.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn test_forgot_then_reset_is_single_use() {
        let s = services().await;
        s.auth.create_subject(register("alice@example.com", "alice")).await.unwrap();

        s.auth.forgot_password("alice@example.com").await.unwrap();
        // Delivery runs on a detached task
        let mut token = None;
        for _ in 0..50 {
            token = s.notifier.last_token_for("alice@example.com");
            if token.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let token = token.expect("reset token delivered");

        s.auth.reset_password(&token, "N3wP@ss!").await.unwrap();
        match s.auth.reset_password(&token, "Other1!").await {
            Err(Error::InvalidToken { kind }) => assert_eq!(kind, TokenErrorKind::Unknown),
            other => panic!("expected invalid token, got {other:?}"),
        }
        assert!(s.auth.login("alice@example.com", "N3wP@ss!", "src").await.is_ok());
    }

    #[tokio::test]
    async fn test_weak_reset_password_keeps_token() {
        let s = services().await;
        s.auth.create_subject(register("alice@example.com", "alice")).await.unwrap();
        let subject = s.identity.get_by_email("alice@example.com").await.unwrap().unwrap();
        let token = "known-token";
        s.auth
            .reset_tokens()
            .store(token, &ResetTokenRecord::new(subject.id, Duration::from_secs(600)), Duration::from_secs(600))
            .await
            .unwrap();

        assert!(matches!(s.auth.reset_password(token, "weak").await, Err(Error::Validation { .. })));
        s.auth.reset_password(token, "N3wP@ss!").await.unwrap();
    }

    #[tokio::test]
    async fn test_forgot_password_is_uniform() {
        let mut config = create_test_config();
        config.auth.forgot_password_min_duration = Duration::from_millis(50);
        let s = create_test_services(&config).await;
        s.auth.create_subject(register("alice@example.com", "alice")).await.unwrap();

        for email in ["alice@example.com", "ghost@example.com"] {
            let started = Instant::now();
            s.auth.forgot_password(email).await.unwrap();
            assert!(started.elapsed() >= Duration::from_millis(50));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(s.notifier.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgot_password_timing_does_not_depend_on_the_email() {
        let floor = Duration::from_millis(250);
        let mut config = create_test_config();
        config.auth.forgot_password_min_duration = floor;
        let s = create_test_services(&config).await;
        s.auth.create_subject(register("alice@example.com", "alice")).await.unwrap();
        let inactive = s.auth.create_subject(register("bob@example.com", "bob")).await.unwrap();
        s.identity
            .update(
                inactive.id,
                SubjectUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mut timings = Vec::new();
        for email in ["alice@example.com", "ghost@example.com", "bob@example.com"] {
            let started = Instant::now();
            s.auth.forgot_password(email).await.unwrap();
            timings.push(started.elapsed());
        }

        for elapsed in &timings {
            assert!(*elapsed >= floor, "{elapsed:?} is under the floor");
        }
        let fastest = timings.iter().min().unwrap().as_secs_f64();
        let slowest = timings.iter().max().unwrap().as_secs_f64();
        assert!(slowest <= fastest * 1.15, "timings diverge: {timings:?}");
    }
}
