//! Request and correlation ids.
//!
//! Every request gets a request id (taken from `x-request-id` when the caller sent a
//! usable one) and a correlation id (`x-correlation-id`, defaulting to the request id).
//! Both are echoed on the response and kept in a task-local so error envelopes can carry
//! the request id without threading it through every call.

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
pub const CORRELATION_ID_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

const MAX_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIds {
    pub request_id: String,
    pub correlation_id: String,
}

tokio::task_local! {
    static REQUEST_IDS: RequestIds;
}

/// Request id of the request being served on this task, if any.
pub fn current_request_id() -> Option<String> {
    REQUEST_IDS.try_with(|ids| ids.request_id.clone()).ok()
}

fn incoming(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    let usable = !value.is_empty() && value.len() <= MAX_ID_LEN && value.chars().all(|c| c.is_ascii_graphic());
    usable.then(|| value.to_string())
}

impl RequestIds {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let request_id = incoming(headers, &REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string());
        let correlation_id = incoming(headers, &CORRELATION_ID_HEADER).unwrap_or_else(|| request_id.clone());
        Self {
            request_id,
            correlation_id,
        }
    }
}

pub async fn request_id(mut request: Request, next: Next) -> Response {
    let ids = RequestIds::from_headers(request.headers());
    request.extensions_mut().insert(ids.clone());

    let mut response = REQUEST_IDS.scope(ids.clone(), next.run(request)).await;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&ids.request_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&ids.correlation_id) {
        headers.insert(CORRELATION_ID_HEADER, value);
    }
    response
}
