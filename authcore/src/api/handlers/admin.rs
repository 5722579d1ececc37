//! Subject and role administration.
//!
//! Every route here sits behind a gate; see [`router`].

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{delete, get, post, put},
};
use uuid::Uuid;

use crate::{
    AppState,
    api::models::{
        ApiJson,
        admin::{AssignRoleRequest, SetPermissionsRequest},
        pagination::PaginatedResponse,
    },
    auth::{
        gate::{self, requires_permission, requires_role},
        principal::Principal,
    },
    errors::{Error, ErrorBody},
    identity::{Role, RoleAssignment, SubjectFilter, SubjectView},
};

/// Admin routes with their gates applied.
pub fn router(state: &AppState) -> Router<AppState> {
    let list = Router::new()
        .route("/admin/subjects", get(list_subjects))
        .route_layer(from_fn_with_state((state.clone(), requires_permission("users.read")), gate::enforce));
    let assignments = Router::new()
        .route("/admin/subjects/{id}/roles", post(assign_role))
        .route("/admin/subjects/{id}/roles/{role}", delete(remove_role))
        .route_layer(from_fn_with_state((state.clone(), requires_permission("roles.write")), gate::enforce));
    let catalog = Router::new()
        .route("/admin/roles/{role}/permissions", put(set_role_permissions))
        .route_layer(from_fn_with_state((state.clone(), requires_role("admin")), gate::enforce));
    list.merge(assignments).merge(catalog)
}

/// List subjects
#[utoipa::path(
    get,
    path = "/admin/subjects",
    tag = "admin",
    params(SubjectFilter),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "A page of subjects", body = PaginatedResponse<SubjectView>),
        (status = 401, description = "Not authenticated", body = ErrorBody),
        (status = 403, description = "Requires users.read", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_subjects(
    State(state): State<AppState>,
    query: Result<Query<SubjectFilter>, QueryRejection>,
) -> Result<Json<PaginatedResponse<SubjectView>>, Error> {
    let Query(filter) = query.map_err(|rejection| Error::BadRequest {
        message: rejection.body_text(),
    })?;
    let filter = filter.normalized();
    let identity = state.auth.identity();
    let (subjects, total) = tokio::try_join!(identity.list(&filter), identity.count(&filter))?;
    Ok(Json(PaginatedResponse::new(
        subjects.into_iter().map(SubjectView::from).collect(),
        total,
        filter.skip,
        filter.limit,
    )))
}

/// Assign a role to a subject
///
/// Idempotent: assigning a role the subject already holds returns the existing assignment.
#[utoipa::path(
    post,
    path = "/admin/subjects/{id}/roles",
    tag = "admin",
    request_body = AssignRoleRequest,
    params(("id" = String, Path, description = "Subject id")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Role assigned", body = RoleAssignment),
        (status = 403, description = "Requires roles.write", body = ErrorBody),
        (status = 404, description = "Unknown subject or role", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all, fields(subject_id = %id))]
pub async fn assign_role(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<AssignRoleRequest>,
) -> Result<Json<RoleAssignment>, Error> {
    let assignment = state.roles.assign_role(id, request.role.trim(), Some(principal.id)).await?;
    Ok(Json(assignment))
}

/// Remove a role from a subject
#[utoipa::path(
    delete,
    path = "/admin/subjects/{id}/roles/{role}",
    tag = "admin",
    params(
        ("id" = String, Path, description = "Subject id"),
        ("role" = String, Path, description = "Role name"),
    ),
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Role removed"),
        (status = 403, description = "Requires roles.write", body = ErrorBody),
        (status = 404, description = "Unknown subject, or the subject does not hold the role", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all, fields(subject_id = %id))]
pub async fn remove_role(State(state): State<AppState>, Path((id, role)): Path<(Uuid, String)>) -> Result<StatusCode, Error> {
    if state.roles.remove_role(id, &role).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::NotFound {
            resource: "Role assignment".to_string(),
            id: format!("{id}/{role}"),
        })
    }
}

/// Replace the permissions carried by a role
#[utoipa::path(
    put,
    path = "/admin/roles/{role}/permissions",
    tag = "admin",
    request_body = SetPermissionsRequest,
    params(("role" = String, Path, description = "Role name")),
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Updated role", body = Role),
        (status = 400, description = "Malformed permission", body = ErrorBody),
        (status = 403, description = "Requires the admin role", body = ErrorBody),
        (status = 404, description = "Unknown role", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all, fields(role = %role))]
pub async fn set_role_permissions(
    State(state): State<AppState>,
    Path(role): Path<String>,
    ApiJson(request): ApiJson<SetPermissionsRequest>,
) -> Result<Json<Role>, Error> {
    Ok(Json(state.roles.set_role_permissions(&role, &request.permissions).await?))
}
