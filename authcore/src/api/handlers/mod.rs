//! HTTP request handlers.
//!
//! - [`auth`]: registration, sessions and password management
//! - [`admin`]: subject and role administration
//!
//! Handlers return [`crate::errors::Error`], which renders as the standard JSON error
//! envelope with the matching status code.

pub mod admin;
pub mod auth;
