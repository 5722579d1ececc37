//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: request and response bodies that exist only for transport
//!
//! # API Structure
//!
//! - **Authentication** (`/auth/*`): registration, login, refresh, logout, the current
//!   subject and the password lifecycle
//! - **Administration** (`/admin/*`): subject listing, role assignment and role permissions,
//!   each behind an authorization gate
//!
//! # OpenAPI Documentation
//!
//! All endpoints are annotated with `utoipa`. The document is served at `/openapi.json`.

pub mod handlers;
pub mod models;
