use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP port for the HTTP listener.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum accepted Git POST body size (e.g. `50mb`).
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            max_upload_size: default_max_upload_size(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_max_upload_size() -> String {
    "50mb".to_string()
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Root directory for cached package repositories and the metadata
    /// database.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Hours before a cached package is refreshed from upstream.
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

fn default_cache_path() -> String {
    "./cached_packages".to_string()
}

fn default_ttl_hours() -> i64 {
    12
}

// ---------------------------------------------------------------------------
// Upstream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the primary package index. Repositories are cloned from
    /// `{index_url}/{name}.git`.
    #[serde(default = "default_index_url")]
    pub index_url: String,
    /// Aggregate mirror repository. Packages appear as branches, cloned via
    /// `git clone --branch {name} --single-branch {mirror_url}`.
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            index_url: default_index_url(),
            mirror_url: default_mirror_url(),
        }
    }
}

fn default_index_url() -> String {
    "https://aur.archlinux.org".to_string()
}

fn default_mirror_url() -> String {
    "https://github.com/archlinux/aur.git".to_string()
}

// ---------------------------------------------------------------------------
// Size parsing
// ---------------------------------------------------------------------------

/// Parse a human-readable size string (`512kb`, `50mb`, `1gb`, `1048576`)
/// into a byte count. Suffixes are case-insensitive; a bare number is taken
/// as bytes.
pub fn parse_size(input: &str) -> Result<usize> {
    let trimmed = input.trim().to_ascii_lowercase();
    anyhow::ensure!(!trimmed.is_empty(), "empty size string");

    let (digits, multiplier) = if let Some(rest) = trimmed.strip_suffix("gb") {
        (rest, 1024 * 1024 * 1024)
    } else if let Some(rest) = trimmed.strip_suffix("mb") {
        (rest, 1024 * 1024)
    } else if let Some(rest) = trimmed.strip_suffix("kb") {
        (rest, 1024)
    } else if let Some(rest) = trimmed.strip_suffix('b') {
        (rest, 1)
    } else {
        (trimmed.as_str(), 1)
    };

    let value: usize = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size string: {input}"))?;

    Ok(value * multiplier)
}

impl ServerConfig {
    /// The configured upload cap in bytes.
    pub fn max_upload_bytes(&self) -> Result<usize> {
        parse_size(&self.max_upload_size)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load a [`Config`] from a YAML file at `path`, falling back to built-in
/// defaults when the file does not exist.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let config = if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?
    } else {
        tracing::warn!(path = %path.display(), "config file not found; using defaults");
        Config::default()
    };

    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(config.server.port > 0, "server.port must be in range 1-65535");
    anyhow::ensure!(config.cache.ttl_hours >= 1, "cache.ttl_hours must be at least 1");
    config
        .server
        .max_upload_bytes()
        .context("server.max_upload_size is not a valid size")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.cache.path, "./cached_packages");
        assert_eq!(config.cache.ttl_hours, 12);
        assert_eq!(config.server.max_upload_bytes().unwrap(), 50 * 1024 * 1024);
    }

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("512kb").unwrap(), 512 * 1024);
        assert_eq!(parse_size("50MB").unwrap(), 50 * 1024 * 1024);
        assert_eq!(parse_size("1gb").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("100b").unwrap(), 100);
        assert_eq!(parse_size("4096").unwrap(), 4096);
    }

    #[test]
    fn parse_size_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("lots").is_err());
        assert!(parse_size("mb").is_err());
    }

    #[test]
    fn zero_port_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn zero_ttl_rejected() {
        let mut config = Config::default();
        config.cache.ttl_hours = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = "server:\n  port: 8080\ncache:\n  path: /tmp/pkgs\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.path, "/tmp/pkgs");
        // Unspecified sections keep their defaults.
        assert_eq!(config.upstream.index_url, "https://aur.archlinux.org");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config("/nonexistent/aurcache-test.yaml").unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
