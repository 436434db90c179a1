//! Health check endpoints.
//!
//! `GET /health` is a liveness probe and never touches dependencies.
//! Readiness is computed by the service from a [`HealthReport`] and rendered
//! here, so load balancers see one JSON shape across services.

use axum::{http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use teetime_runtime::{HealthCheck, HealthReport, HealthStatus};

/// Liveness probe.
///
/// ```text
/// GET /health  →  200 "ok"
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// One component in a readiness response.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentBody {
    /// Component name
    pub component: String,
    /// `healthy`, `degraded` or `unhealthy`
    pub status: String,
    /// Details, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Component metadata
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl From<&HealthCheck> for ComponentBody {
    fn from(check: &HealthCheck) -> Self {
        Self {
            component: check.component.clone(),
            status: check.status.to_string(),
            message: check.message.clone(),
            metadata: check.metadata.iter().cloned().collect(),
        }
    }
}

/// Readiness response body.
///
/// ```json
/// {
///   "status": "healthy",
///   "timestamp": "2025-01-01T00:00:00Z",
///   "checks": [{ "component": "capacity_store", "status": "healthy" }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReadinessBody {
    /// Overall status, the worst of all checks
    pub status: String,
    /// When the report was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Individual checks
    pub checks: Vec<ComponentBody>,
}

/// Render a readiness report.
///
/// Healthy and degraded answer 200 so a degraded instance keeps serving;
/// unhealthy answers 503.
#[must_use]
pub fn readiness(report: &HealthReport) -> (StatusCode, Json<ReadinessBody>) {
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let body = ReadinessBody {
        status: report.status.to_string(),
        timestamp: report.timestamp,
        checks: report.checks.iter().map(ComponentBody::from).collect(),
    };

    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[test]
    fn test_degraded_is_still_ready() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("booking_repository"),
            HealthCheck::degraded("capacity_store", "journal lagging")
                .with_metadata("slots", "12"),
        ]);

        let (status, Json(body)) = readiness(&report);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.status, "degraded");
        assert_eq!(body.checks[1].metadata.get("slots").map(String::as_str), Some("12"));
    }

    #[test]
    fn test_unhealthy_is_unavailable() {
        let report = HealthReport::new(vec![HealthCheck::unhealthy("store", "shutting down")]);
        let (status, Json(body)) = readiness(&report);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.checks[0].message.as_deref(), Some("shutting down"));
    }
}
