//! Database layer for data persistence and access.
//!
//! ```text
//! ┌──────────────────┐
//! │ identity, auth   │  (stores behind traits)
//! └────────┬─────────┘
//!          ↓
//! ┌──────────────────┐
//! │ db::handlers     │  (repositories, one per table)
//! └────────┬─────────┘
//!          ↓
//! ┌──────────────────┐
//! │ PostgreSQL       │  (primary, optional read replica)
//! └──────────────────┘
//! ```
//!
//! - [`handlers`]: repositories for CRUD operations
//! - [`pools`]: primary and replica pools
//! - [`transaction`]: commit/rollback and retry helpers
//! - [`errors`]: database-specific error types
//!
//! Migrations live in `migrations/` and are embedded by [`crate::migrator`].

pub mod errors;
pub mod handlers;
pub mod pools;
pub mod transaction;
