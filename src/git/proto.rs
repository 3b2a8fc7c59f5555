//! Smart HTTP protocol plumbing: request classification, repository name
//! extraction, packet-line framing, and git-dir file resolution.
//!
//! # Packet-line format
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself; `0000` is the flush packet. A service advertisement begins with
//! `# service=<name>\n` framed as a packet line, followed by a flush.

use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Substrings that mark a path as Git protocol traffic.
///
/// Deliberately broad: bare `HEAD` and `objects/` hits match legacy dumb
/// clients that probe those paths directly. A stricter predicate anchored to
/// path segments would misclassify some of that traffic.
const GIT_MARKERS: &[&str] = &[
    "/info/refs",
    "/HEAD",
    "/objects/",
    "/refs/",
    "git-upload-pack",
    "git-receive-pack",
];

/// Whether `path` should be routed to the Git gateway.
pub fn is_git_request(path: &str) -> bool {
    path.ends_with(".git")
        || path.contains(".git/")
        || GIT_MARKERS.iter().any(|marker| path.contains(marker))
}

/// Pack and object transfers count as meaningful accesses; ref and metadata
/// probes do not.
pub fn is_meaningful_request(path: &str) -> bool {
    path.contains("git-upload-pack") || path.contains("git-receive-pack") || path.contains("/objects/")
}

// ---------------------------------------------------------------------------
// Repository name extraction
// ---------------------------------------------------------------------------

/// Extract the package name from a Git request path.
///
/// `/foo.git` and `/foo.git/info/refs` both name `foo`; any other shape
/// names its first path segment.
pub fn extract_repo_name(path: &str) -> Option<String> {
    let name = if let Some(prefix) = path.strip_suffix(".git") {
        basename(prefix).to_string()
    } else if let Some(idx) = path.find(".git/") {
        basename(&path[..idx]).to_string()
    } else {
        path.trim_start_matches('/')
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string()
    };

    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Packet-line framing
// ---------------------------------------------------------------------------

/// Encode a byte slice as a Git packet-line (4-hex-digit length prefix +
/// data). The length includes the 4 prefix bytes themselves.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    assert!(
        total_len <= 0xFFFF,
        "packet-line data too large ({total_len} bytes)"
    );
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

/// The framed announcement that precedes a ref advertisement:
/// `# service=<name>\n` as a packet line, then a flush packet.
pub fn service_announcement(service: &str) -> Vec<u8> {
    let mut buf = encode_pkt_line(format!("# service={service}\n").as_bytes());
    buf.extend_from_slice(b"0000");
    buf
}

// ---------------------------------------------------------------------------
// Git-dir file resolution
// ---------------------------------------------------------------------------

/// Map a request path onto a file inside `git_dir`.
///
/// `info/refs` and `HEAD` resolve to their well-known locations; `objects/`
/// and `refs/` suffixes resolve from the start of that component; `.git/`
/// suffixes resolve verbatim.
pub fn resolve_git_file(git_dir: &std::path::Path, path: &str) -> Option<PathBuf> {
    if path.contains("/info/refs") {
        return Some(git_dir.join("info/refs"));
    }
    if path.contains("/HEAD") {
        return Some(git_dir.join("HEAD"));
    }
    if let Some(idx) = path.find("objects/") {
        return Some(git_dir.join(&path[idx..]));
    }
    if let Some(idx) = path.find("refs/") {
        return Some(git_dir.join(&path[idx..]));
    }
    if let Some(idx) = path.find(".git/") {
        return Some(git_dir.join(&path[idx + ".git/".len()..]));
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
