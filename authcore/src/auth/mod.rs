//! Authentication and authorization.
//!
//! # Credentials
//!
//! - [`password`]: argon2id digests over `password || pepper`, strength rules
//! - [`tokens`]: HS256 access and refresh tokens, rotation, revocation
//! - [`revocation`]: the shared key-value store behind blacklists, locks and reset tokens
//! - [`reset_tokens`]: single-use password reset tokens
//! - [`lockout`]: per-account lock after repeated failed logins
//!
//! # Authorization
//!
//! - [`permission_cache`]: read-through cache of roles and effective permissions
//! - [`roles`]: role mutations with cache invalidation
//! - [`gate`]: route predicates over the principal
//!
//! # Request side
//!
//! - [`principal`]: the [`Principal`](principal::Principal) extractors
//! - [`middleware`]: `require_auth` and `optional_auth` route layers
//!
//! [`service::AuthService`] ties the credential pieces together into the operations the
//! `/auth` routes expose.
//!
//! ```ignore
//! use authcore::auth::principal::Principal;
//!
//! async fn whoami(principal: Principal) -> String {
//!     principal.username
//! }
//! ```

pub mod gate;
pub mod lockout;
pub mod middleware;
pub mod password;
pub mod permission_cache;
pub mod principal;
pub mod reset_tokens;
pub mod revocation;
pub mod roles;
pub mod service;
pub mod tokens;
