//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /`                        - welcome text
//! - `GET  /healthz`                 - liveness probe
//! - `GET  /stats`                   - aggregate statistics
//! - `GET  /stats/top-fetched`       - most-fetched packages
//! - `GET  /stats/top-requested`     - most-requested packages
//! - `ANY  /rpc`, `/rpc/…`           - upstream-compatible RPC
//! - fallback                        - Git smart HTTP traffic or plain echo

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::git::proto;
use crate::store::{CountEntry, RecentEntry};
use crate::{health, rpc, AppState};

use super::gateway;

const WELCOME: &str = "aurcache - caching Git proxy for the AUR\n\n\
    Git:   git clone http://<this-host>/<package>.git\n\
    RPC:   /rpc/?v=5&type=info&arg[]=<package>\n\
    Stats: /stats\n";

const DEFAULT_TOP_LIMIT: usize = 10;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    // Validated at startup; the fallback only guards against a config type
    // constructed without `load_config`.
    let max_body_bytes = state
        .config
        .server
        .max_upload_bytes()
        .unwrap_or(50 * 1024 * 1024);

    Router::new()
        .route("/", get(handle_index))
        .route("/healthz", get(health::handle_health))
        .route("/stats", get(handle_stats))
        .route("/stats/top-fetched", get(handle_top_fetched))
        .route("/stats/top-requested", get(handle_top_requested))
        .route("/rpc", any(handle_rpc))
        .route("/rpc/", any(handle_rpc))
        // Git paths are free-form (`/<pkg>.git/...`), so they are classified
        // in the fallback rather than enumerated as routes.
        .fallback(handle_fallback)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Simple handlers
// ---------------------------------------------------------------------------

async fn handle_index() -> &'static str {
    WELCOME
}

async fn handle_rpc(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    rpc::handle_rpc(&state, &uri).await
}

/// Anything that is not an explicit route: Git traffic by path shape,
/// RPC subpaths, or a plain-text echo for everything else.
async fn handle_fallback(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let path = uri.path();

    if path == "/rpc" || path.starts_with("/rpc/") {
        return rpc::handle_rpc(&state, &uri).await;
    }

    if proto::is_git_request(path) {
        return gateway::handle_git_request(&state, method, uri, body)
            .await
            .unwrap_or_else(IntoResponse::into_response);
    }

    (StatusCode::OK, format!("{method} {path}")).into_response()
}

// ---------------------------------------------------------------------------
// Stats handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    total_packages: i64,
    total_requests: i64,
    total_fetches: i64,
    cache_size: String,
    last_updated: String,
    most_fetched: Vec<CountEntry>,
    most_requested: Vec<CountEntry>,
    recently_fetched: Vec<RecentEntry>,
}

async fn handle_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let store = &state.store;

    let totals = store.stats().unwrap_or_else(|e| {
        warn!(error = %e, "stats query failed");
        Default::default()
    });

    let most_fetched = store.top_fetched(DEFAULT_TOP_LIMIT).unwrap_or_default();
    let most_requested = store.top_requested(DEFAULT_TOP_LIMIT).unwrap_or_default();
    let recently_fetched = store.recently_fetched(DEFAULT_TOP_LIMIT).unwrap_or_default();

    // The size walk touches every cached repository on disk.
    let size_store = Arc::clone(&state.store);
    let cache_size = tokio::task::spawn_blocking(move || size_store.cache_size())
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "cache size task panicked");
            Ok(String::from("0.00 B"))
        })
        .unwrap_or_else(|e| {
            warn!(error = %e, "cache size walk failed");
            String::from("0.00 B")
        });

    Json(StatsResponse {
        total_packages: totals.total_packages,
        total_requests: totals.total_requests,
        total_fetches: totals.total_fetches,
        cache_size,
        last_updated: Utc::now().to_rfc3339(),
        most_fetched,
        most_requested,
        recently_fetched,
    })
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn handle_top_fetched(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<CountEntry>> {
    let limit = params.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    Json(state.store.top_fetched(limit).unwrap_or_default())
}

async fn handle_top_requested(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<CountEntry>> {
    let limit = params.limit.unwrap_or(DEFAULT_TOP_LIMIT);
    Json(state.store.top_requested(limit).unwrap_or_default())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The requested repository or file does not exist and could not be
    /// materialized.
    NotFound(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
