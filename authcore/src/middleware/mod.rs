//! Cross-cutting request pipeline layers.
//!
//! Outermost first, as assembled by [`crate::build_router`]:
//!
//! 1. [`request_id`]: request and correlation ids
//! 2. `TraceLayer` spans, with sensitive headers masked
//! 3. [`access_log`]: one structured line per request
//! 4. [`recovery`]: panics become `INTERNAL_ERROR`
//! 5. [`security_headers`]
//! 6. CORS
//! 7. [`rate_limit`]
//!
//! Login and password reset handlers also charge [`charge_auth_attempt`], a stricter
//! per-source bucket.
//!
//! Authentication and authorization gates are route layers, see [`crate::auth::middleware`]
//! and [`crate::auth::gate`].

pub mod access_log;
pub mod rate_limit;
pub mod recovery;
pub mod request_id;
pub mod security_headers;

pub use access_log::{PrincipalSlot, access_log};
pub use rate_limit::{ClientAddress, charge_auth_attempt, rate_limit};
pub use recovery::catch_panic_layer;
pub use request_id::{RequestIds, current_request_id, request_id};
pub use security_headers::security_headers;
