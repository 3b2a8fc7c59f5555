//! Upstream-compatible RPC endpoint.
//!
//! Answers `info`, `multiinfo`, and `search` queries from the local cache,
//! synthesizing the upstream JSON from parsed build recipes. Responses are
//! written through the metadata store's RPC cache under a canonical key so
//! that argument order does not fragment the cache.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, error, instrument, warn};
use url::form_urlencoded;

use crate::cache::manager::RECIPE_FILE;
use crate::recipe::{self, PackageInfo};
use crate::AppState;

// ---------------------------------------------------------------------------
// Response variants
// ---------------------------------------------------------------------------

/// The three response shapes of the RPC surface.
///
/// Serialized untagged: each variant carries its complete field set, so the
/// encoder never needs a discriminator.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Info {
        resultcount: usize,
        results: Vec<PackageInfo>,
        #[serde(rename = "type")]
        kind: &'static str,
        version: i64,
    },
    Empty {
        resultcount: usize,
        results: Vec<PackageInfo>,
        #[serde(rename = "type")]
        kind: String,
        version: i64,
    },
    Error {
        error: &'static str,
        #[serde(rename = "type")]
        kind: &'static str,
        version: i64,
    },
}

impl RpcResponse {
    /// A populated result set. The response type is always `multiinfo`,
    /// matching upstream behaviour even for single-package `info` queries.
    fn info(results: Vec<PackageInfo>) -> Self {
        Self::Info {
            resultcount: results.len(),
            results,
            kind: "multiinfo",
            version: 5,
        }
    }

    /// An empty result set echoing the inbound type and version.
    fn empty(kind: impl Into<String>, version: i64) -> Self {
        Self::Empty {
            resultcount: 0,
            results: Vec::new(),
            kind: kind.into(),
            version,
        }
    }

    fn internal_error() -> Self {
        Self::Error {
            error: "Internal server error",
            kind: "error",
            version: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Query model
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RpcQuery {
    kind: Option<String>,
    version: i64,
    /// Values of repeated `arg[]` parameters (info/multiinfo).
    multi_args: Vec<String>,
    /// Value of the single `arg` parameter (search).
    arg: Option<String>,
}

fn parse_query(query: &str) -> RpcQuery {
    let mut parsed = RpcQuery {
        version: 5,
        ..RpcQuery::default()
    };

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "type" if parsed.kind.is_none() => parsed.kind = Some(value.into_owned()),
            "v" => {
                if let Ok(v) = value.parse::<i64>() {
                    parsed.version = v;
                }
            }
            "arg[]" => parsed.multi_args.push(value.into_owned()),
            "arg" => {
                let owned = value.into_owned();
                if parsed.arg.is_none() {
                    parsed.arg = Some(owned.clone());
                }
                parsed.multi_args.push(owned);
            }
            _ => {}
        }
    }

    parsed
}

/// Canonical cache key for a request: normalizes argument order so that
/// permuted `arg[]` lists share one cache row.
pub fn canonical_key(path: &str, query: &str) -> String {
    let parsed = parse_query(query);

    match parsed.kind.as_deref() {
        Some("search") => {
            let arg = parsed.arg.unwrap_or_default();
            format!("{path}?type=search&arg={arg}")
        }
        Some(kind @ ("info" | "multiinfo")) => {
            let mut names = parsed.multi_args;
            names.sort();
            format!("{path}?type={kind}&packages={}", names.join(","))
        }
        _ => format!("{path}?{query}"),
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve one RPC request.
#[instrument(skip(state), fields(path = %uri.path()))]
pub async fn handle_rpc(state: &Arc<AppState>, uri: &Uri) -> Response {
    let path = uri.path();
    let query = uri.query().unwrap_or("");
    let key = canonical_key(path, query);

    match state.store.rpc_cache_get(&key) {
        Ok(Some(cached)) => return json_response(StatusCode::OK, cached),
        Ok(None) => {}
        Err(e) => warn!(key, error = %e, "rpc cache read failed"),
    }

    match build_response(state, query).await {
        Ok(response) => {
            let body = match serde_json::to_string_pretty(&response) {
                Ok(body) => body.into_bytes(),
                Err(e) => {
                    error!(error = %e, "rpc response serialization failed");
                    return error_response();
                }
            };

            if matches!(response, RpcResponse::Info { .. }) {
                if let Err(e) = state.store.rpc_cache_put(&key, &body) {
                    warn!(key, error = %e, "rpc cache write failed");
                }
            }

            json_response(StatusCode::OK, body)
        }
        Err(e) => {
            error!(error = %e, "rpc request failed");
            error_response()
        }
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn error_response() -> Response {
    let body = serde_json::to_string_pretty(&RpcResponse::internal_error())
        .unwrap_or_else(|_| String::from("{}"))
        .into_bytes();
    json_response(StatusCode::INTERNAL_SERVER_ERROR, body)
}

// ---------------------------------------------------------------------------
// Query handling
// ---------------------------------------------------------------------------

async fn build_response(state: &Arc<AppState>, query: &str) -> Result<RpcResponse> {
    let parsed = parse_query(query);

    match parsed.kind.as_deref() {
        Some(kind @ ("info" | "multiinfo")) => {
            if parsed.multi_args.is_empty() {
                return Ok(RpcResponse::empty(kind, parsed.version));
            }
            let results = collect_packages(state, &parsed.multi_args).await?;
            Ok(RpcResponse::info(results))
        }
        Some("search") => {
            let Some(term) = parsed.arg.filter(|t| !t.is_empty()) else {
                return Ok(RpcResponse::empty("search", parsed.version));
            };
            let results = search_packages(state, &term).await?;
            Ok(RpcResponse::info(results))
        }
        Some(other) => Ok(RpcResponse::empty(other, parsed.version)),
        None => Ok(RpcResponse::empty("unknown", parsed.version)),
    }
}

/// Materialize and parse each named package, skipping names the upstream
/// does not know.
async fn collect_packages(state: &Arc<AppState>, names: &[String]) -> Result<Vec<PackageInfo>> {
    let mut results = Vec::with_capacity(names.len());

    for name in names {
        let Some(ensured) = state.cache.ensure_package(name).await? else {
            debug!(name, "package unavailable; omitting from results");
            continue;
        };

        // A fresh materialization already counted this request through its
        // inserted row.
        if ensured.freshness != crate::cache::Freshness::Cloned {
            if let Err(e) = state.store.touch_access(name) {
                warn!(name, error = %e, "touch_access failed");
            }
        }

        match read_and_parse(name, &ensured.info.path).await {
            Ok(info) => results.push(info),
            Err(e) => warn!(name, error = %e, "recipe unreadable; omitting from results"),
        }
    }

    Ok(results)
}

/// Case-insensitive substring search over the cached package directory.
/// When nothing matches, the literal term is tried against upstream so a
/// first-time search for an exact name still succeeds.
async fn search_packages(state: &Arc<AppState>, term: &str) -> Result<Vec<PackageInfo>> {
    let needle = term.to_lowercase();

    let cached = state
        .cache
        .list_cached()
        .context("failed to list cache directory")?;

    let matches: Vec<String> = cached
        .into_iter()
        .filter(|name| name.to_lowercase().contains(&needle))
        .collect();

    if matches.is_empty() {
        debug!(term, "no cached match; trying upstream for the literal term");
        if let Some(ensured) = state.cache.ensure_package(term).await? {
            if ensured.freshness != crate::cache::Freshness::Cloned {
                if let Err(e) = state.store.touch_access(term) {
                    warn!(term, error = %e, "touch_access failed");
                }
            }
            let info = read_and_parse(term, &ensured.info.path).await?;
            return Ok(vec![info]);
        }
        return Ok(Vec::new());
    }

    let mut results = Vec::with_capacity(matches.len());
    for name in &matches {
        if let Err(e) = state.store.touch_access(name) {
            warn!(name, error = %e, "touch_access failed");
        }
        match read_and_parse(name, &state.cache.repo_path(name)).await {
            Ok(info) => results.push(info),
            Err(e) => warn!(name, error = %e, "recipe unreadable; omitting from results"),
        }
    }
    Ok(results)
}

async fn read_and_parse(name: &str, repo_path: &std::path::Path) -> Result<PackageInfo> {
    let recipe_path = repo_path.join(RECIPE_FILE);
    let contents = tokio::fs::read(&recipe_path)
        .await
        .with_context(|| format!("failed to read {}", recipe_path.display()))?;
    Ok(recipe::parse_recipe(name, &contents).await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
