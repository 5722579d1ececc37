use crate::auth::tokens::TokenErrorKind;
use crate::db::errors::DbError;
use crate::middleware::request_id::current_request_id;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

/// Field name -> list of failed rules, rendered as `details` in the error envelope.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(ThisError, Debug)]
pub enum Error {
    /// No `Authorization` header on a route that requires one
    #[error("Missing authorization header")]
    MissingAuthHeader,

    /// `Authorization` header present but not `Bearer <token>`
    #[error("Invalid authorization header format")]
    InvalidAuthFormat,

    /// Authentication required but not provided
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Bearer token rejected by the token service
    #[error("Invalid token ({kind:?})")]
    InvalidToken { kind: TokenErrorKind },

    /// Login failed. Deliberately identical for unknown subject, inactive subject, and bad password
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Too many failed logins against this account
    #[error("Account locked for {retry_after:?}")]
    AccountLocked { retry_after: Duration },

    /// Principal lacks the capability. Never names the missing role or permission
    #[error("Insufficient permissions")]
    InsufficientPermissions,

    /// Malformed request that isn't tied to particular fields
    #[error("{message}")]
    BadRequest { message: String },

    /// Caller-fixable input violation with per-field reasons
    #[error("Validation failed: {message}")]
    Validation { message: String, details: FieldErrors },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Uniqueness or precondition violation
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Throttled by a rate limiter
    #[error("{message}")]
    TooManyRequests { message: String, retry_after: Option<Duration> },

    /// A downstream dependency is unavailable or timed out
    #[error("Dependency unavailable: {dependency}")]
    Unavailable { dependency: String },

    /// Operation not supported by the current deployment (e.g. revocation without a store)
    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Error taxonomy. Each variant of [`Error`] belongs to exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    Unauthorized,
    Forbidden,
    NotFound,
    RateLimited,
    Dependency,
    Internal,
}

/// JSON error envelope returned for every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Human readable message, safe to display
    pub error: String,
    /// Stable machine readable code, e.g. `INVALID_TOKEN`
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FieldErrors>,
    pub request_id: Option<String>,
}

impl Error {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        let mut details = FieldErrors::new();
        details.insert(field.to_string(), vec![reason.into()]);
        Error::Validation {
            message: format!("Invalid {field}"),
            details,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingAuthHeader
            | Error::InvalidAuthFormat
            | Error::Unauthenticated { .. }
            | Error::InvalidToken { .. }
            | Error::InvalidCredentials
            | Error::AccountLocked { .. } => ErrorKind::Unauthorized,
            Error::InsufficientPermissions => ErrorKind::Forbidden,
            Error::BadRequest { .. } | Error::Validation { .. } => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Conflict { .. } => ErrorKind::Conflict,
            Error::TooManyRequests { .. } => ErrorKind::RateLimited,
            Error::Unavailable { .. } | Error::Unsupported { .. } => ErrorKind::Dependency,
            Error::Internal { .. } | Error::Other(_) => ErrorKind::Internal,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => ErrorKind::NotFound,
                DbError::UniqueViolation { .. } => ErrorKind::Conflict,
                DbError::ForeignKeyViolation { .. } | DbError::CheckViolation { .. } => ErrorKind::Validation,
                DbError::Retryable { .. } | DbError::Unavailable(_) => ErrorKind::Dependency,
                DbError::Other(_) => ErrorKind::Internal,
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Dependency => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine readable code for the error envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingAuthHeader => "MISSING_AUTH_HEADER",
            Error::InvalidAuthFormat => "INVALID_AUTH_FORMAT",
            Error::Unauthenticated { .. } => "UNAUTHORIZED",
            Error::InvalidToken {
                kind: TokenErrorKind::Expired,
            } => "TOKEN_EXPIRED",
            Error::InvalidToken { .. } => "INVALID_TOKEN",
            Error::InvalidCredentials => "INVALID_CREDENTIALS",
            Error::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Error::InsufficientPermissions => "INSUFFICIENT_PERMISSIONS",
            _ => match self.kind() {
                ErrorKind::Validation => "VALIDATION_ERROR",
                ErrorKind::Conflict => "CONFLICT",
                ErrorKind::Unauthorized => "UNAUTHORIZED",
                ErrorKind::Forbidden => "FORBIDDEN",
                ErrorKind::NotFound => "NOT_FOUND",
                ErrorKind::RateLimited => "RATE_LIMIT_EXCEEDED",
                ErrorKind::Dependency => "SERVICE_UNAVAILABLE",
                ErrorKind::Internal => "INTERNAL_ERROR",
            },
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::MissingAuthHeader => "Authorization header is required".to_string(),
            Error::InvalidAuthFormat => "Authorization header must use the Bearer scheme".to_string(),
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InvalidToken {
                kind: TokenErrorKind::Expired,
            } => "Token has expired".to_string(),
            Error::InvalidToken { .. } => "Invalid or revoked token".to_string(),
            Error::InvalidCredentials => "Invalid email or password".to_string(),
            Error::AccountLocked { .. } => "Account temporarily locked due to repeated failed logins".to_string(),
            Error::InsufficientPermissions => "You do not have permission to perform this action".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::Validation { message, .. } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::TooManyRequests { message, .. } => message.clone(),
            Error::Unavailable { .. } | Error::Unsupported { .. } => "Service temporarily unavailable".to_string(),
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                DbError::UniqueViolation { constraint, table, .. } => match (table.as_deref(), constraint.as_deref()) {
                    (Some("subjects"), Some(c)) if c.contains("email") => "An account with this email address already exists".to_string(),
                    (Some("subjects"), Some(c)) if c.contains("username") => "This username is already taken".to_string(),
                    (Some("roles"), _) => "A role with this name already exists".to_string(),
                    _ => "Resource already exists".to_string(),
                },
                DbError::ForeignKeyViolation { .. } => "Invalid reference to related resource".to_string(),
                DbError::CheckViolation { .. } => "Invalid data provided".to_string(),
                DbError::Retryable { .. } | DbError::Unavailable(_) => "Service temporarily unavailable".to_string(),
                DbError::Other(_) => "Internal server error".to_string(),
            },
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::AccountLocked { retry_after } => Some(*retry_after),
            Error::TooManyRequests { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Build the JSON envelope for this error.
    pub fn body(&self) -> ErrorBody {
        let details = match self {
            Error::Validation { details, .. } if !details.is_empty() => Some(details.clone()),
            _ => None,
        };
        ErrorBody {
            error: self.user_message(),
            code: self.code().to_string(),
            details,
            request_id: current_request_id(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match self.kind() {
            ErrorKind::Internal => tracing::error!(code = self.code(), "Internal service error: {:#}", self),
            ErrorKind::Dependency => tracing::warn!(code = self.code(), "Dependency error: {:#}", self),
            ErrorKind::Unauthorized | ErrorKind::Forbidden => tracing::info!(code = self.code(), "Authorization error: {}", self),
            ErrorKind::RateLimited | ErrorKind::Conflict => tracing::warn!(code = self.code(), "{}", self),
            ErrorKind::Validation | ErrorKind::NotFound => tracing::debug!(code = self.code(), "Client error: {}", self),
        }

        let status = self.status_code();
        let mut response = (status, Json(self.body())).into_response();

        if let Some(retry_after) = self.retry_after() {
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        response
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
