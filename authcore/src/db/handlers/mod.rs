//! Repository implementations for database access.
//!
//! Each repository wraps a borrowed `PgConnection`, so it works the same on a pooled
//! connection and inside a transaction:
//!
//! ```ignore
//! let mut tx = pools.begin().await?;
//! let subject = Subjects::new(&mut tx).create(&new_subject).await?;
//! Roles::new(&mut tx).assign(subject.id, "user", None).await?;
//! tx.commit().await?;
//! ```
//!
//! - [`Subjects`]: subject rows and the list filter
//! - [`Roles`]: the role catalog, role permissions and assignments
//! - [`PgRevocationStore`]: the shared revocation key space
//! - [`PgBucketStore`]: shared token buckets for the rate limiter

pub mod rate_limits;
pub mod repository;
pub mod revocations;
pub mod roles;
pub mod subjects;

pub use rate_limits::PgBucketStore;
pub use repository::Repository;
pub use revocations::PgRevocationStore;
pub use roles::Roles;
pub use subjects::Subjects;
