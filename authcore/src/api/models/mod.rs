//! Request and response bodies of the HTTP API.
//!
//! Service-level types that are already part of the contract ([`crate::auth::service::LoginResponse`],
//! [`crate::identity::SubjectView`], [`crate::auth::tokens::TokenPair`], ...) are used directly;
//! this module only holds the payloads that exist purely for transport.

pub mod admin;
pub mod auth;
pub mod pagination;

use axum::{
    Json,
    extract::{FromRequest, Request, rejection::JsonRejection},
};
use serde::de::DeserializeOwned;

use crate::errors::Error;

/// JSON body extractor whose rejection uses the standard error envelope.
#[derive(Debug, Clone)]
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(request: Request, state: &S) -> Result<Self, Error> {
        match Json::<T>::from_request(request, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(rejection.into()),
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::BadRequest {
            message: rejection.body_text(),
        }
    }
}
