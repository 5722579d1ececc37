//! OpenAPI document for the HTTP surface, served at `/openapi.json`.

use axum::Json;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::{api, auth, errors, health, identity};

struct BearerSecurityAddon;

impl Modify for BearerSecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.security_schemes.insert(
                "bearer".to_string(),
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "Access token from `POST /auth/login` or `POST /auth/refresh`:\n\n\
                            ```\nAuthorization: Bearer <access_token>\n```",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    modifiers(&BearerSecurityAddon),
    paths(
        api::handlers::auth::register,
        api::handlers::auth::login,
        api::handlers::auth::refresh,
        api::handlers::auth::logout,
        api::handlers::auth::me,
        api::handlers::auth::change_password,
        api::handlers::auth::forgot_password,
        api::handlers::auth::reset_password,
        api::handlers::admin::list_subjects,
        api::handlers::admin::assign_role,
        api::handlers::admin::remove_role,
        api::handlers::admin::set_role_permissions,
        health::handlers::liveness,
        health::handlers::readiness,
    ),
    components(schemas(
        errors::ErrorBody,
        auth::service::CreateSubject,
        auth::service::LoginResponse,
        auth::service::MeResponse,
        auth::tokens::TokenPair,
        identity::SubjectView,
        identity::Role,
        identity::RoleAssignment,
        api::models::auth::LoginRequest,
        api::models::auth::RefreshRequest,
        api::models::auth::LogoutRequest,
        api::models::auth::ChangePasswordRequest,
        api::models::auth::ForgotPasswordRequest,
        api::models::auth::ResetPasswordRequest,
        api::models::auth::MessageResponse,
        api::models::admin::AssignRoleRequest,
        api::models::admin::SetPermissionsRequest,
        health::HealthReport,
        health::CheckResult,
        health::HealthStatus,
        health::FailureKind,
    )),
    tags(
        (name = "authentication", description = "Registration, login, sessions and password lifecycle"),
        (name = "admin", description = "Subject and role administration"),
        (name = "health", description = "Liveness and readiness probes"),
    )
)]
pub struct ApiDoc;

#[tracing::instrument(skip_all)]
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
