use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::AppState;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub store: CheckResult,
    pub cache_dir: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// `GET /healthz`
///
/// Read-only liveness probe: verifies the metadata store answers queries
/// and the cache root exists. Never mutates state.
pub async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = match state.store.stats() {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(e.to_string()),
    };

    let cache_dir = if state.cache.root().is_dir() {
        CheckResult::healthy()
    } else {
        CheckResult::unhealthy(format!(
            "cache directory missing: {}",
            state.cache.root().display()
        ))
    };

    let healthy = store.ok && cache_dir.ok;
    let response = HealthResponse {
        status: if healthy {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        },
        checks: HealthChecks { store, cache_dir },
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}
