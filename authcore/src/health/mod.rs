//! Liveness and readiness probes.
//!
//! Readiness runs every registered [`HealthCheck`] concurrently, each bounded by the
//! configured timeout (never more than one second). Only critical checks can make the
//! instance unready; non-critical failures degrade the report but keep a 200.
//!
//! Once [`HealthRegistry::begin_shutdown`] is called both probes answer 503 straight
//! away, without running any check, so load balancers drain the instance.

pub mod checks;
pub mod handlers;

use async_trait::async_trait;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use utoipa::ToSchema;

/// Upper bound on any single check, whatever the configuration says.
pub const MAX_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn status_code(self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Failed,
    Timeout,
}

/// Why a check failed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CheckFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl CheckFailure {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Failed,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub message: String,
    /// Milliseconds the check took
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub critical: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: BTreeMap<String, CheckResult>,
}

impl HealthReport {
    fn empty(status: HealthStatus) -> Self {
        Self {
            status,
            timestamp: Utc::now(),
            checks: BTreeMap::new(),
        }
    }
}

/// A dependency probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failure makes the instance unready
    fn critical(&self) -> bool;

    /// Probe the dependency. `Ok` may carry details for the report.
    async fn check(&self) -> Result<Option<serde_json::Value>, CheckFailure>;
}

struct Inner {
    checks: Vec<Arc<dyn HealthCheck>>,
    timeout: Duration,
    shutting_down: AtomicBool,
}

/// Registered checks plus the shutdown flag. Cheap to clone.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<Inner>,
}

impl HealthRegistry {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                checks,
                timeout: timeout.min(MAX_CHECK_TIMEOUT),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Flip both probes to 503. Irreversible.
    pub fn begin_shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            info!("Health probes now report shutdown");
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn liveness(&self) -> HealthReport {
        if self.is_shutting_down() {
            HealthReport::empty(HealthStatus::Unhealthy)
        } else {
            HealthReport::empty(HealthStatus::Healthy)
        }
    }

    pub async fn readiness(&self) -> HealthReport {
        if self.is_shutting_down() {
            return HealthReport::empty(HealthStatus::Unhealthy);
        }

        let results = join_all(self.inner.checks.iter().map(|check| self.run(check.as_ref()))).await;

        let mut status = HealthStatus::Healthy;
        let mut checks = BTreeMap::new();
        for (name, result) in results {
            if result.status == HealthStatus::Unhealthy {
                if result.critical {
                    status = HealthStatus::Unhealthy;
                } else if status == HealthStatus::Healthy {
                    status = HealthStatus::Degraded;
                }
            }
            checks.insert(name, result);
        }

        // Shutdown may have begun while checks were running
        if self.is_shutting_down() {
            status = HealthStatus::Unhealthy;
        }

        HealthReport {
            status,
            timestamp: Utc::now(),
            checks,
        }
    }

    async fn run(&self, check: &dyn HealthCheck) -> (String, CheckResult) {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.inner.timeout, check.check()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CheckFailure {
                kind: FailureKind::Timeout,
                message: format!("Check timed out after {}ms", self.inner.timeout.as_millis()),
            }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(details) => CheckResult {
                status: HealthStatus::Healthy,
                message: "ok".to_string(),
                duration_ms,
                timestamp: Utc::now(),
                critical: check.critical(),
                failure: None,
                details,
            },
            Err(failure) => {
                warn!(check = check.name(), critical = check.critical(), error = %failure, "Health check failed");
                CheckResult {
                    status: HealthStatus::Unhealthy,
                    message: failure.message,
                    duration_ms,
                    timestamp: Utc::now(),
                    critical: check.critical(),
                    failure: Some(failure.kind),
                    details: None,
                }
            }
        };
        (check.name().to_string(), result)
    }
}
