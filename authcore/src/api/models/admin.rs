use serde::Deserialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct AssignRoleRequest {
    pub role: String,
}

/// Full replacement of a role's permission set.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SetPermissionsRequest {
    /// `resource.action`, `resource.*` or `*`
    pub permissions: Vec<String>,
}
