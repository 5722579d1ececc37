//! One structured log line per request.
//!
//! The principal is learned after routing, so the access log plants a [`PrincipalSlot`]
//! in the request extensions and the authentication layer fills it in. Headers are never
//! logged.

use axum::{extract::Request, middleware::Next, response::Response};
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{info, warn};

use crate::middleware::request_id::RequestIds;
use crate::types::SubjectId;

/// Write-once holder for the authenticated subject of the current request.
#[derive(Debug, Clone, Default)]
pub struct PrincipalSlot(Arc<OnceLock<SubjectId>>);

impl PrincipalSlot {
    pub fn fill(&self, id: SubjectId) {
        let _ = self.0.set(id);
    }

    pub fn get(&self) -> Option<SubjectId> {
        self.0.get().copied()
    }
}

pub async fn access_log(mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request.extensions().get::<RequestIds>().map(|ids| ids.request_id.clone());
    let slot = PrincipalSlot::default();
    request.extensions_mut().insert(slot.clone());

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis() as u64;
    let principal_id = slot.get().map(|id| id.to_string());
    if response.status().is_server_error() {
        warn!(
            target: "authcore::access",
            %method, path, status, duration_ms, principal_id, request_id,
            "request failed"
        );
    } else {
        info!(
            target: "authcore::access",
            %method, path, status, duration_ms, principal_id, request_id,
            "request completed"
        );
    }
    response
}
