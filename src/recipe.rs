//! PKGBUILD field extraction.
//!
//! A PKGBUILD is a shell script declaring metadata variables. Two
//! strategies, tried in order:
//!
//! 1. **Shell evaluation**: source the recipe under `set -euo pipefail` in a
//!    bash child and echo each wanted variable as a `KEY=value` line, arrays
//!    expanded with `[@]`. Handles values built by concatenation or
//!    parameter expansion. Capped at 10 seconds.
//! 2. **Line scan**: take the first `key=` line per key; a `(...)` value is
//!    a whitespace-separated array, anything else a scalar; quotes stripped.
//!
//! Sourcing an untrusted script is inherently unsafe; the evaluation runs
//! with a hard deadline and any failure silently falls back to the scan.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::runner;

/// Wall-clock cap for the bash evaluation strategy.
const EVAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Scalar variables extracted from a recipe.
const SCALAR_KEYS: &[&str] = &["pkgname", "pkgbase", "pkgver", "pkgrel", "pkgdesc", "url"];

/// Array variables extracted from a recipe.
const ARRAY_KEYS: &[&str] = &[
    "license",
    "depends",
    "makedepends",
    "conflicts",
    "provides",
    "replaces",
    "keywords",
];

// ---------------------------------------------------------------------------
// Output type
// ---------------------------------------------------------------------------

/// Package metadata in the field naming of the upstream RPC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "PackageBase")]
    pub package_base: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Maintainer")]
    pub maintainer: String,
    #[serde(rename = "NumVotes")]
    pub num_votes: u32,
    #[serde(rename = "Popularity")]
    pub popularity: f64,
    #[serde(rename = "OutOfDate")]
    pub out_of_date: Option<i64>,
    #[serde(rename = "FirstSubmitted")]
    pub first_submitted: i64,
    #[serde(rename = "LastModified")]
    pub last_modified: i64,
    #[serde(rename = "License")]
    pub license: Vec<String>,
    #[serde(rename = "Depends")]
    pub depends: Vec<String>,
    #[serde(rename = "MakeDepends")]
    pub make_depends: Vec<String>,
    #[serde(rename = "Conflicts")]
    pub conflicts: Vec<String>,
    #[serde(rename = "Provides")]
    pub provides: Vec<String>,
    #[serde(rename = "Replaces")]
    pub replaces: Vec<String>,
    #[serde(rename = "Keywords")]
    pub keywords: Vec<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Extract metadata for `name` from raw recipe bytes.
///
/// Never fails: an unusable recipe yields a record of defaults.
#[instrument(skip(contents), fields(%name))]
pub async fn parse_recipe(name: &str, contents: &[u8]) -> PackageInfo {
    match eval_with_shell(contents).await {
        Ok(fields) => build_info(name, &fields),
        Err(e) => {
            debug!(error = %e, "shell evaluation failed; falling back to line scan");
            build_info(name, &scan_lines(contents))
        }
    }
}

// ---------------------------------------------------------------------------
// Strategy 1: shell evaluation
// ---------------------------------------------------------------------------

async fn eval_with_shell(contents: &[u8]) -> Result<HashMap<String, Vec<String>>> {
    let recipe = tempfile::NamedTempFile::new().context("failed to create recipe temp file")?;
    let mut file = tokio::fs::File::create(recipe.path())
        .await
        .context("failed to open recipe temp file")?;
    file.write_all(contents)
        .await
        .context("failed to write recipe temp file")?;
    file.flush().await.context("failed to flush recipe temp file")?;
    drop(file);

    let mut script = String::from("set -euo pipefail\nsource \"$1\" >/dev/null 2>&1\n");
    for key in SCALAR_KEYS {
        script.push_str(&format!("echo \"{key}=${{{key}:-}}\"\n"));
    }
    for key in ARRAY_KEYS {
        script.push_str(&format!("echo \"{key}=${{{key}[@]:-}}\"\n"));
    }

    let path = recipe
        .path()
        .to_str()
        .context("recipe temp path is not UTF-8")?;

    let output = runner::run_batched(
        "bash",
        &["-c", script.as_str(), "recipe-eval", path],
        None,
        None,
        Some(EVAL_TIMEOUT),
    )
    .await?;

    anyhow::ensure!(
        output.ok,
        "recipe evaluation failed: {}",
        output.stderr_text()
    );

    let text = String::from_utf8_lossy(&output.stdout).into_owned();
    let mut fields = HashMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let tokens = if ARRAY_KEYS.contains(&key) {
            value.split_whitespace().map(str::to_string).collect()
        } else {
            vec![value.to_string()]
        };
        fields.insert(key.to_string(), tokens);
    }
    Ok(fields)
}

// ---------------------------------------------------------------------------
// Strategy 2: line scan
// ---------------------------------------------------------------------------

/// Best-effort scan of `key=value` assignment lines.
fn scan_lines(contents: &[u8]) -> HashMap<String, Vec<String>> {
    let text = String::from_utf8_lossy(contents);
    let mut fields = HashMap::new();

    for key in SCALAR_KEYS.iter().chain(ARRAY_KEYS) {
        let prefix = format!("{key}=");
        let Some(raw) = text
            .lines()
            .map(str::trim_start)
            .find_map(|line| line.strip_prefix(&prefix))
        else {
            continue;
        };

        let raw = raw.trim();
        let tokens: Vec<String> = if raw.starts_with('(') && raw.ends_with(')') {
            raw[1..raw.len() - 1]
                .split_whitespace()
                .map(strip_quotes)
                .filter(|token| !token.is_empty())
                .collect()
        } else {
            let scalar = strip_quotes(raw);
            if scalar.is_empty() {
                continue;
            }
            vec![scalar]
        };

        if !tokens.is_empty() {
            fields.insert((*key).to_string(), tokens);
        }
    }

    fields
}

fn strip_quotes(token: &str) -> String {
    token.trim_matches(|c| c == '"' || c == '\'').to_string()
}

// ---------------------------------------------------------------------------
// Record assembly
// ---------------------------------------------------------------------------

fn build_info(name: &str, fields: &HashMap<String, Vec<String>>) -> PackageInfo {
    let scalar = |key: &str| -> Option<String> {
        fields.get(key).and_then(|v| v.first()).cloned()
    };
    let array = |key: &str| -> Vec<String> { fields.get(key).cloned().unwrap_or_default() };

    let pkgver = scalar("pkgver").unwrap_or_else(|| "unknown".to_string());
    let pkgrel = scalar("pkgrel").unwrap_or_else(|| "1".to_string());
    let now = Utc::now().timestamp();

    PackageInfo {
        name: scalar("pkgname").unwrap_or_else(|| name.to_string()),
        package_base: scalar("pkgbase")
            .or_else(|| scalar("pkgname"))
            .unwrap_or_else(|| name.to_string()),
        version: format!("{pkgver}-{pkgrel}"),
        description: scalar("pkgdesc").unwrap_or_else(|| "No description available".to_string()),
        url: scalar("url").unwrap_or_default(),
        maintainer: "Unknown".to_string(),
        num_votes: 0,
        popularity: 0.0,
        out_of_date: None,
        first_submitted: now,
        last_modified: now,
        license: array("license"),
        depends: array("depends"),
        make_depends: array("makedepends"),
        conflicts: array("conflicts"),
        provides: array("provides"),
        replaces: array("replaces"),
        keywords: array("keywords"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"
pkgname=ripgrep-git
pkgver=14.1.0
pkgrel=2
pkgdesc="Recursively search directories for a regex pattern"
url="https://github.com/BurntSushi/ripgrep"
license=('MIT' 'Unlicense')
depends=(gcc-libs)
makedepends=('cargo' 'git')
"#;

    #[test]
    fn scan_extracts_scalars_and_arrays() {
        let fields = scan_lines(SIMPLE.as_bytes());
        let info = build_info("ripgrep-git", &fields);

        assert_eq!(info.name, "ripgrep-git");
        assert_eq!(info.version, "14.1.0-2");
        assert_eq!(
            info.description,
            "Recursively search directories for a regex pattern"
        );
        assert_eq!(info.url, "https://github.com/BurntSushi/ripgrep");
        assert_eq!(info.license, vec!["MIT", "Unlicense"]);
        assert_eq!(info.depends, vec!["gcc-libs"]);
        assert_eq!(info.make_depends, vec!["cargo", "git"]);
        assert_eq!(info.maintainer, "Unknown");
        assert_eq!(info.num_votes, 0);
        assert!(info.out_of_date.is_none());
    }

    #[test]
    fn scan_defaults_for_missing_fields() {
        let info = build_info("mystery", &scan_lines(b"# not a real recipe\n"));
        assert_eq!(info.name, "mystery");
        assert_eq!(info.package_base, "mystery");
        assert_eq!(info.version, "unknown-1");
        assert_eq!(info.description, "No description available");
        assert_eq!(info.url, "");
        assert!(info.depends.is_empty());
    }

    #[test]
    fn scan_takes_first_assignment() {
        let recipe = b"pkgver=1.0\npkgver=2.0\n";
        let fields = scan_lines(recipe);
        assert_eq!(fields["pkgver"], vec!["1.0"]);
    }

    #[test]
    fn scan_uses_pkgbase_when_present() {
        let recipe = b"pkgbase=linux-ck\npkgname=linux-ck-generic\npkgver=6.9\npkgrel=1\n";
        let info = build_info("linux-ck-generic", &scan_lines(recipe));
        assert_eq!(info.package_base, "linux-ck");
        assert_eq!(info.name, "linux-ck-generic");
    }

    #[test]
    fn scan_missing_pkgrel_defaults_to_one() {
        let recipe = b"pkgname=foo\npkgver=0.3\n";
        let info = build_info("foo", &scan_lines(recipe));
        assert_eq!(info.version, "0.3-1");
    }

    #[tokio::test]
    async fn shell_eval_resolves_expansions() {
        let recipe = br#"
_base=2.4
pkgname=expando
pkgver="${_base}.7"
pkgrel=1
depends=('glibc' "zlib")
"#;
        let info = parse_recipe("expando", recipe).await;
        // Only the shell path can resolve ${_base}; the value proves which
        // strategy ran.
        assert_eq!(info.version, "2.4.7-1");
        assert_eq!(info.depends, vec!["glibc", "zlib"]);
    }

    #[tokio::test]
    async fn broken_recipe_falls_back_to_scan() {
        let recipe = br#"
pkgname=brokenpkg
pkgver=1.2
pkgrel=3
exit 1
"#;
        let info = parse_recipe("brokenpkg", recipe).await;
        assert_eq!(info.name, "brokenpkg");
        assert_eq!(info.version, "1.2-3");
    }

    #[tokio::test]
    async fn fallback_matches_scan_output() {
        // A recipe the shell path cannot evaluate must produce exactly the
        // line-scan record.
        let recipe = b"pkgname=samecheck\npkgver=9\nsyntax error here ((\n";
        let via_parse = parse_recipe("samecheck", recipe).await;
        let via_scan = build_info("samecheck", &scan_lines(recipe));
        assert_eq!(via_parse.name, via_scan.name);
        assert_eq!(via_parse.version, via_scan.version);
        assert_eq!(via_parse.depends, via_scan.depends);
    }

    #[test]
    fn serializes_with_rpc_field_names() {
        let info = build_info("ser", &scan_lines(b"pkgname=ser\npkgver=1\npkgrel=1\n"));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["Name"], "ser");
        assert_eq!(json["Version"], "1-1");
        assert_eq!(json["NumVotes"], 0);
        assert!(json["OutOfDate"].is_null());
        assert!(json["Depends"].is_array());
    }
}
