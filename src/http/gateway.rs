//! Git smart HTTP gateway.
//!
//! Translates classified Git requests into subprocess invocations of
//! `git-upload-pack` / `git-receive-pack` and static reads from the cached
//! repository's Git directory. Pack negotiation runs batched (request body
//! on stdin, collected stdout as the response); ref advertisements stream
//! the subprocess stdout behind the packet-line service announcement.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::{
    body::Body,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};
use url::form_urlencoded;

use crate::cache::Freshness;
use crate::git::proto;
use crate::runner;
use crate::AppState;

use super::handler::AppError;

/// Body of every repository-miss response.
pub const REPO_NOT_FOUND: &str =
    "Repository not found in cache and could not be fetched from upstream";

const CACHE_CONTROL_NO_CACHE: &str = "no-cache, max-age=0, must-revalidate";

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Serve one classified Git request.
#[instrument(skip(state, body), fields(%method, path = %uri.path()))]
pub async fn handle_git_request(
    state: &Arc<AppState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Result<Response, AppError> {
    let path = uri.path().to_string();

    let Some(name) = proto::extract_repo_name(&path) else {
        return Err(AppError::NotFound(REPO_NOT_FOUND.to_string()));
    };

    let ensured = state
        .cache
        .ensure_package(&name)
        .await
        .map_err(AppError::Internal)?;
    let Some(ensured) = ensured else {
        return Err(AppError::NotFound(REPO_NOT_FOUND.to_string()));
    };

    // A fresh materialization inserts its row with total_requests = 1, which
    // already counts this request; only pre-existing repositories take the
    // extra access touch.
    if ensured.freshness != Freshness::Cloned {
        if let Err(e) = state.store.touch_access(&name) {
            warn!(name, error = %e, "touch_access failed");
        }
    }

    if proto::is_meaningful_request(&path) {
        if let Err(e) = state.store.touch_meaningful(&name) {
            warn!(name, error = %e, "touch_meaningful failed");
        }
        if ensured.freshness == Freshness::Hit {
            if let Err(e) = state.store.increment_fetch(&name) {
                warn!(name, error = %e, "increment_fetch failed");
            }
        }
    }

    let git_dir = ensured.info.git_dir.clone();

    if method == Method::POST && path.contains("git-upload-pack") {
        return run_pack_service(
            &git_dir,
            "git-upload-pack",
            "application/x-git-upload-pack-result",
            &body,
        )
        .await;
    }
    if method == Method::POST && path.contains("git-receive-pack") {
        return run_pack_service(
            &git_dir,
            "git-receive-pack",
            "application/x-git-receive-pack-result",
            &body,
        )
        .await;
    }
    if method == Method::GET {
        return serve_get(&git_dir, &uri, &path).await;
    }

    Ok(StatusCode::METHOD_NOT_ALLOWED.into_response())
}

// ---------------------------------------------------------------------------
// GET dispatch
// ---------------------------------------------------------------------------

async fn serve_get(git_dir: &Path, uri: &Uri, path: &str) -> Result<Response, AppError> {
    match service_param(uri.query()) {
        Some(service) if service == "git-upload-pack" => {
            return advertise_refs(
                git_dir,
                "git-upload-pack",
                "application/x-git-upload-pack-advertisement",
            );
        }
        Some(service) if service == "git-receive-pack" => {
            return advertise_refs(
                git_dir,
                "git-receive-pack",
                "application/x-git-receive-pack-advertisement",
            );
        }
        _ => {}
    }

    if path.contains("/info/refs") {
        let file = git_dir.join("info/refs");
        if file.is_file() {
            return stream_file(&file, "text/plain").await;
        }
        // No static advertisement on disk: fall through. Paths like
        // `pkg.git/info/refs` resolve (and 404) below; bare `pkg/info/refs`
        // reaches the redirect, which fills in the service parameter.
    }

    if path.contains("/HEAD") {
        let file = git_dir.join("HEAD");
        if !file.is_file() {
            return Err(AppError::NotFound("HEAD not found".to_string()));
        }
        return stream_file(&file, "text/plain").await;
    }

    if path.contains("/objects/") || path.contains("/refs/") || path.contains(".git/") {
        if let Some(file) = proto::resolve_git_file(git_dir, path) {
            if file.is_file() {
                return stream_file(&file, "application/octet-stream").await;
            }
        }
        return Err(AppError::NotFound("repository file not found".to_string()));
    }

    Ok(redirect_to_advertisement(path))
}

fn redirect_to_advertisement(path: &str) -> Response {
    let location = format!(
        "{}/info/refs?service=git-upload-pack",
        path.trim_end_matches('/')
    );
    debug!(%location, "redirecting bare repository path to advertisement");
    (
        StatusCode::FOUND,
        [(header::LOCATION, location)],
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Pack services
// ---------------------------------------------------------------------------

/// Batched pack negotiation: request body to stdin, collected stdout back.
async fn run_pack_service(
    git_dir: &Path,
    program: &str,
    content_type: &'static str,
    body: &[u8],
) -> Result<Response, AppError> {
    let git_dir_str = git_dir_str(git_dir)?;

    let output = runner::run_batched(
        program,
        &["--stateless-rpc", git_dir_str],
        None,
        Some(body),
        None,
    )
    .await
    .map_err(AppError::Internal)?;

    if !output.ok {
        warn!(%program, exit = ?output.exit_code, "pack service failed");
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, output.stderr_text()).into_response());
    }

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        output.stdout,
    )
        .into_response())
}

/// Streamed ref advertisement: packet-line announcement, then live
/// subprocess stdout.
fn advertise_refs(
    git_dir: &Path,
    service: &str,
    content_type: &'static str,
) -> Result<Response, AppError> {
    let git_dir_str = git_dir_str(git_dir)?;

    let stdout = runner::spawn_streaming(
        service,
        &["--stateless-rpc", "--advertise-refs", git_dir_str],
        None,
    )
    .map_err(AppError::Internal)?;

    let announcement = proto::service_announcement(service);
    let reader = Cursor::new(announcement).chain(stdout);
    let body = Body::from_stream(ReaderStream::new(reader));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, CACHE_CONTROL_NO_CACHE),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Static files
// ---------------------------------------------------------------------------

async fn stream_file(path: &Path, content_type: &'static str) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))
        .map_err(AppError::Internal)?;

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn service_param(query: Option<&str>) -> Option<String> {
    let query = query?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "service")
        .map(|(_, value)| value.into_owned())
}

fn git_dir_str(git_dir: &Path) -> Result<&str, AppError> {
    git_dir
        .to_str()
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("git dir path is not valid UTF-8")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_param_parses_query() {
        assert_eq!(
            service_param(Some("service=git-upload-pack")).as_deref(),
            Some("git-upload-pack")
        );
        assert_eq!(
            service_param(Some("foo=bar&service=git-receive-pack")).as_deref(),
            Some("git-receive-pack")
        );
        assert_eq!(service_param(Some("foo=bar")), None);
        assert_eq!(service_param(None), None);
    }

    #[test]
    fn redirect_points_at_advertisement() {
        let response = redirect_to_advertisement("/ripgrep.git");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/ripgrep.git/info/refs?service=git-upload-pack"
        );
    }

    #[tokio::test]
    async fn pack_service_failure_returns_500_with_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        // An empty directory is not a repository; upload-pack exits non-zero.
        let response = run_pack_service(
            tmp.path(),
            "git-upload-pack",
            "application/x-git-upload-pack-result",
            b"0000",
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
