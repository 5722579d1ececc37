use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::{
        ApiJson,
        auth::{
            ChangePasswordRequest, ForgotPasswordRequest, LoginRequest, LogoutRequest, MessageResponse, RefreshRequest,
            ResetPasswordRequest,
        },
    },
    auth::{
        principal::{Authenticated, Principal},
        service::{CreateSubject, LoginResponse, MeResponse},
        tokens::TokenPair,
    },
    errors::{Error, ErrorBody},
    identity::SubjectView,
    middleware::{ClientAddress, charge_auth_attempt},
};

/// Register a new subject
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = CreateSubject,
    tag = "authentication",
    responses(
        (status = 201, description = "Subject registered", body = SubjectView),
        (status = 400, description = "Invalid input or registration disabled", body = ErrorBody),
        (status = 409, description = "Email or username already taken", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateSubject>,
) -> Result<(StatusCode, Json<SubjectView>), Error> {
    if !state.config.auth.allow_registration {
        return Err(Error::BadRequest {
            message: "Registration is disabled".to_string(),
        });
    }
    let subject = state.auth.create_subject(request).await?;
    Ok((StatusCode::CREATED, Json(subject)))
}

/// Log in with email and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Logged in", body = LoginResponse),
        (status = 401, description = "Invalid credentials or account locked", body = ErrorBody),
        (status = 429, description = "Too many attempts from this source", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    source: ClientAddress,
    ApiJson(request): ApiJson<LoginRequest>,
) -> Result<Json<LoginResponse>, Error> {
    if let Err(e) = charge_auth_attempt(&state, source).await {
        state.auth.lock_account(&request.email).await;
        return Err(e);
    }
    let response = state
        .auth
        .login(&request.email, &request.password, &source.to_string())
        .await?;
    Ok(Json(response))
}

/// Exchange a refresh token for a new token pair
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Rotated token pair", body = TokenPair),
        (status = 401, description = "Refresh token invalid, expired or already used", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn refresh(State(state): State<AppState>, ApiJson(request): ApiJson<RefreshRequest>) -> Result<Json<TokenPair>, Error> {
    Ok(Json(state.auth.refresh(&request.refresh_token).await?))
}

/// Revoke the presented access token, and optionally a refresh token
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body(content = Option<LogoutRequest>),
    tag = "authentication",
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Logged out"),
        (status = 401, description = "Not authenticated", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, auth: Authenticated, body: Bytes) -> Result<StatusCode, Error> {
    // The body is optional, so it is parsed by hand rather than through ApiJson
    let request: LogoutRequest = if body.iter().all(u8::is_ascii_whitespace) {
        LogoutRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| Error::BadRequest {
            message: format!("Invalid logout body: {e}"),
        })?
    };
    state
        .auth
        .logout(&auth.token, &auth.claims, request.refresh_token.as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The calling subject with live roles and permissions
#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "authentication",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Current subject", body = MeResponse),
        (status = 401, description = "Not authenticated", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn me(State(state): State<AppState>, principal: Principal) -> Result<Json<MeResponse>, Error> {
    Ok(Json(state.auth.me(principal.id).await?))
}

/// Change the caller's password
#[utoipa::path(
    post,
    path = "/auth/password/change",
    request_body = ChangePasswordRequest,
    tag = "authentication",
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Password changed"),
        (status = 400, description = "Current password wrong or new password rejected", body = ErrorBody),
        (status = 401, description = "Not authenticated", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn change_password(
    State(state): State<AppState>,
    principal: Principal,
    ApiJson(request): ApiJson<ChangePasswordRequest>,
) -> Result<StatusCode, Error> {
    state
        .auth
        .change_password(principal.id, &request.current_password, &request.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Request a password reset link
///
/// Always answers 202 with the same body, whether or not the email is registered.
#[utoipa::path(
    post,
    path = "/auth/password/forgot",
    request_body = ForgotPasswordRequest,
    tag = "authentication",
    responses(
        (status = 202, description = "Request accepted", body = MessageResponse),
        (status = 429, description = "Too many attempts from this source", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn forgot_password(
    State(state): State<AppState>,
    source: ClientAddress,
    ApiJson(request): ApiJson<ForgotPasswordRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), Error> {
    charge_auth_attempt(&state, source).await?;
    state.auth.forgot_password(&request.email).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse::new("If an account with that email exists, a reset link has been sent")),
    ))
}

/// Set a new password with a reset token
#[utoipa::path(
    post,
    path = "/auth/password/reset",
    request_body = ResetPasswordRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "New password rejected", body = ErrorBody),
        (status = 401, description = "Reset token invalid, expired or used", body = ErrorBody),
        (status = 429, description = "Too many attempts from this source", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn reset_password(
    State(state): State<AppState>,
    source: ClientAddress,
    ApiJson(request): ApiJson<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, Error> {
    charge_auth_attempt(&state, source).await?;
    state.auth.reset_password(&request.token, &request.new_password).await?;
    Ok(Json(MessageResponse::new("Password has been reset")))
}
