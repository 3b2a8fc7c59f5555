//! Package metadata store backed by a single SQLite file under the cache
//! root.
//!
//! Three relations: `packages` (per-package counters and TTL), `rpc_cache`
//! (previously served RPC response bodies), and `hourly_activity` (reserved
//! for bucketed stats; the relation is created but not yet written).
//!
//! All queries are short and run under an internal connection mutex. Callers
//! in request handlers treat per-call errors as absence of data; only
//! [`MetadataStore::open`] failures are fatal.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

/// RPC cache entries older than this many seconds are evicted at read time.
const RPC_CACHE_MAX_AGE_SECS: i64 = 12 * 3600;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// One row of the `packages` relation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRecord {
    pub name: String,
    pub fetched_at: i64,
    pub last_accessed: i64,
    pub last_meaningful_access: i64,
    pub ttl_hours: i64,
    pub fetch_count: i64,
    pub total_requests: i64,
}

/// A `(name, count)` pair for the top-N statistics queries.
#[derive(Debug, Clone, Serialize)]
pub struct CountEntry {
    pub name: String,
    pub count: i64,
}

/// A recently fetched package with a human-readable timestamp.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentEntry {
    pub name: String,
    pub fetched_at: String,
}

/// Aggregate totals across the `packages` relation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreTotals {
    pub total_packages: i64,
    pub total_requests: i64,
    pub total_fetches: i64,
}

// ---------------------------------------------------------------------------
// MetadataStore
// ---------------------------------------------------------------------------

/// Process-wide handle to the metadata database.
pub struct MetadataStore {
    conn: Mutex<Connection>,
    cache_root: PathBuf,
}

impl MetadataStore {
    /// Open (or create) the database at `{cache_root}/packages.db`, create
    /// missing relations, and repair any non-positive counters.
    ///
    /// Errors here are fatal to the process: every other operation assumes
    /// an initialized schema.
    pub fn open(cache_root: &Path) -> Result<Self> {
        let db_path = cache_root.join("packages.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS packages (
                 name                   TEXT PRIMARY KEY,
                 fetched_at             INTEGER NOT NULL,
                 last_accessed          INTEGER NOT NULL,
                 last_meaningful_access INTEGER NOT NULL,
                 ttl_hours              INTEGER NOT NULL DEFAULT 12,
                 fetch_count            INTEGER NOT NULL DEFAULT 1,
                 total_requests         INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE IF NOT EXISTS rpc_cache (
                 key           TEXT PRIMARY KEY,
                 response_data BLOB NOT NULL,
                 cached_at     INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS hourly_activity (
                 hour_start    INTEGER NOT NULL,
                 package_name  TEXT NOT NULL,
                 fetch_count   INTEGER NOT NULL DEFAULT 0,
                 request_count INTEGER NOT NULL DEFAULT 0,
                 PRIMARY KEY (hour_start, package_name)
             );",
        )
        .context("failed to create metadata relations")?;

        let store = Self {
            conn: Mutex::new(conn),
            cache_root: cache_root.to_path_buf(),
        };

        let repaired = store.fix_zero_counts()?;
        if repaired > 0 {
            warn!(repaired, "repaired non-positive package counters at startup");
        }

        info!(db = %db_path.display(), "metadata store initialized");
        Ok(store)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-query; propagating the panic is
        // the only sound option.
        self.conn.lock().expect("metadata store mutex poisoned")
    }

    // -- write operations ---------------------------------------------------

    /// Record a successful materialization or refresh of `name`.
    ///
    /// Inserts a fresh row with all counters at 1, or advances `fetched_at`,
    /// bumps `fetch_count`, and overwrites `ttl_hours` on an existing row.
    pub fn record_fetch(&self, name: &str, ttl_hours: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn()
            .execute(
                "INSERT INTO packages
                     (name, fetched_at, last_accessed, last_meaningful_access,
                      ttl_hours, fetch_count, total_requests)
                 VALUES (?1, ?2, ?2, ?2, ?3, 1, 1)
                 ON CONFLICT(name) DO UPDATE SET
                     fetched_at  = excluded.fetched_at,
                     fetch_count = packages.fetch_count + 1,
                     ttl_hours   = excluded.ttl_hours",
                params![name, now, ttl_hours],
            )
            .with_context(|| format!("record_fetch failed for {name}"))?;
        debug!(name, ttl_hours, "recorded fetch");
        Ok(())
    }

    /// Note any request touching `name`. No-op when the package is unknown.
    pub fn touch_access(&self, name: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn()
            .execute(
                "UPDATE packages
                 SET last_accessed = ?2, total_requests = total_requests + 1
                 WHERE name = ?1",
                params![name, now],
            )
            .with_context(|| format!("touch_access failed for {name}"))?;
        Ok(())
    }

    /// Note pack/object traffic for `name`. No-op when the package is
    /// unknown.
    pub fn touch_meaningful(&self, name: &str) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn()
            .execute(
                "UPDATE packages SET last_meaningful_access = ?2 WHERE name = ?1",
                params![name, now],
            )
            .with_context(|| format!("touch_meaningful failed for {name}"))?;
        Ok(())
    }

    /// Count a request against an already-materialized repository as a fetch.
    pub fn increment_fetch(&self, name: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE packages SET fetch_count = fetch_count + 1 WHERE name = ?1",
                params![name],
            )
            .with_context(|| format!("increment_fetch failed for {name}"))?;
        Ok(())
    }

    /// Whether `name` must be (re-)materialized: true when no record exists
    /// or the record's TTL has elapsed since the last successful fetch.
    pub fn should_refresh(&self, name: &str) -> Result<bool> {
        let row: Option<(i64, i64)> = self
            .conn()
            .query_row(
                "SELECT fetched_at, ttl_hours FROM packages WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("should_refresh query failed for {name}"))?;

        let Some((fetched_at, ttl_hours)) = row else {
            return Ok(true);
        };

        let age = Utc::now().timestamp() - fetched_at;
        Ok(age >= ttl_hours * 3600)
    }

    /// One-shot startup repair: any `fetch_count` or `total_requests` that is
    /// NULL or non-positive becomes 1. Returns the number of rows touched.
    pub fn fix_zero_counts(&self) -> Result<usize> {
        let conn = self.conn();
        let a = conn
            .execute(
                "UPDATE packages SET fetch_count = 1
                 WHERE fetch_count IS NULL OR fetch_count <= 0",
                [],
            )
            .context("fix_zero_counts: fetch_count")?;
        let b = conn
            .execute(
                "UPDATE packages SET total_requests = 1
                 WHERE total_requests IS NULL OR total_requests <= 0",
                [],
            )
            .context("fix_zero_counts: total_requests")?;
        Ok(a + b)
    }

    // -- read operations ----------------------------------------------------

    /// Fetch a single package record, if it exists.
    pub fn get_record(&self, name: &str) -> Result<Option<PackageRecord>> {
        self.conn()
            .query_row(
                "SELECT name, fetched_at, last_accessed, last_meaningful_access,
                        ttl_hours, fetch_count, total_requests
                 FROM packages WHERE name = ?1",
                params![name],
                row_to_record,
            )
            .optional()
            .with_context(|| format!("get_record failed for {name}"))
    }

    /// The `limit` packages with the highest fetch counts.
    pub fn top_fetched(&self, limit: usize) -> Result<Vec<CountEntry>> {
        self.top_by_column("fetch_count", limit)
    }

    /// The `limit` packages with the highest total request counts.
    pub fn top_requested(&self, limit: usize) -> Result<Vec<CountEntry>> {
        self.top_by_column("total_requests", limit)
    }

    fn top_by_column(&self, column: &str, limit: usize) -> Result<Vec<CountEntry>> {
        // `column` is one of two compile-time literals, never user input.
        let sql = format!(
            "SELECT name, {column} FROM packages ORDER BY {column} DESC, name ASC LIMIT ?1"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).context("prepare top query")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(CountEntry {
                    name: row.get(0)?,
                    count: row.get(1)?,
                })
            })
            .context("run top query")?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The `limit` most recently fetched packages, newest first.
    pub fn recently_fetched(&self, limit: usize) -> Result<Vec<RecentEntry>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT name, fetched_at FROM packages
                 ORDER BY fetched_at DESC, name ASC LIMIT ?1",
            )
            .context("prepare recently_fetched")?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let name: String = row.get(0)?;
                let fetched_at: i64 = row.get(1)?;
                Ok((name, fetched_at))
            })
            .context("run recently_fetched")?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(name, ts)| RecentEntry {
                name,
                fetched_at: format_timestamp(ts),
            })
            .collect())
    }

    /// Aggregate totals for the stats endpoint.
    pub fn stats(&self) -> Result<StoreTotals> {
        self.conn()
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(total_requests), 0),
                        COALESCE(SUM(fetch_count), 0)
                 FROM packages",
                [],
                |row| {
                    Ok(StoreTotals {
                        total_packages: row.get(0)?,
                        total_requests: row.get(1)?,
                        total_fetches: row.get(2)?,
                    })
                },
            )
            .context("stats query failed")
    }

    /// Sum the on-disk sizes of every recorded package directory and render
    /// the total as a human-readable string.
    ///
    /// Walks the filesystem; call from `spawn_blocking` in async contexts.
    pub fn cache_size(&self) -> Result<String> {
        let names: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn
                .prepare("SELECT name FROM packages")
                .context("prepare cache_size")?;
            let names = stmt
                .query_map([], |row| row.get(0))
                .context("run cache_size")?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            names
        };

        let mut total: u64 = 0;
        for name in names {
            total += dir_size(&self.cache_root.join(&name));
        }
        Ok(format_bytes(total))
    }

    // -- RPC response cache -------------------------------------------------

    /// Return the cached response body for `key` when it is younger than the
    /// 12-hour window; otherwise delete the stale row and return `None`.
    pub fn rpc_cache_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn();
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT response_data, cached_at FROM rpc_cache WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("rpc_cache_get failed for {key}"))?;

        let Some((data, cached_at)) = row else {
            return Ok(None);
        };

        if Utc::now().timestamp() - cached_at < RPC_CACHE_MAX_AGE_SECS {
            debug!(key, "rpc cache hit");
            return Ok(Some(data));
        }

        conn.execute("DELETE FROM rpc_cache WHERE key = ?1", params![key])
            .with_context(|| format!("rpc_cache_get eviction failed for {key}"))?;
        debug!(key, "rpc cache entry expired");
        Ok(None)
    }

    /// Store (or replace) the response body for `key`.
    pub fn rpc_cache_put(&self, key: &str, data: &[u8]) -> Result<()> {
        let now = Utc::now().timestamp();
        self.conn()
            .execute(
                "INSERT INTO rpc_cache (key, response_data, cached_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     response_data = excluded.response_data,
                     cached_at     = excluded.cached_at",
                params![key, data, now],
            )
            .with_context(|| format!("rpc_cache_put failed for {key}"))?;
        Ok(())
    }

    // -- test support -------------------------------------------------------

    /// Rewind `fetched_at` by `secs` seconds so TTL behaviour can be tested
    /// without sleeping.
    #[cfg(test)]
    pub(crate) fn backdate_fetch(&self, name: &str, secs: i64) {
        self.conn()
            .execute(
                "UPDATE packages SET fetched_at = fetched_at - ?2 WHERE name = ?1",
                params![name, secs],
            )
            .unwrap();
    }

    /// Rewind `cached_at` on an RPC cache row.
    #[cfg(test)]
    pub(crate) fn backdate_rpc_entry(&self, key: &str, secs: i64) {
        self.conn()
            .execute(
                "UPDATE rpc_cache SET cached_at = cached_at - ?2 WHERE key = ?1",
                params![key, secs],
            )
            .unwrap();
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageRecord> {
    Ok(PackageRecord {
        name: row.get(0)?,
        fetched_at: row.get(1)?,
        last_accessed: row.get(2)?,
        last_meaningful_access: row.get(3)?,
        ttl_hours: row.get(4)?,
        fetch_count: row.get(5)?,
        total_requests: row.get(6)?,
    })
}

/// Unix seconds to RFC 3339, falling back to the raw number if out of range.
fn format_timestamp(ts: i64) -> String {
    match chrono::DateTime::<Utc>::from_timestamp(ts, 0) {
        Some(dt) => dt.to_rfc3339(),
        None => ts.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Size helpers
// ---------------------------------------------------------------------------

/// Recursively compute the total size of all files under `dir`. Unreadable
/// entries are skipped; a missing directory contributes 0.
pub(crate) fn dir_size(dir: &Path) -> u64 {
    let mut total: u64 = 0;

    if !dir.exists() {
        return 0;
    }

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }

    total
}

/// Render a byte count in powers of 1024 with a two-decimal suffix.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, MetadataStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn record_fetch_inserts_with_unit_counters() {
        let (_tmp, store) = open_store();
        store.record_fetch("ripgrep-git", 12).unwrap();

        let record = store.get_record("ripgrep-git").unwrap().unwrap();
        assert_eq!(record.fetch_count, 1);
        assert_eq!(record.total_requests, 1);
        assert_eq!(record.ttl_hours, 12);
        assert_eq!(record.fetched_at, record.last_accessed);
    }

    #[test]
    fn record_fetch_updates_existing_row() {
        let (_tmp, store) = open_store();
        store.record_fetch("yay", 12).unwrap();
        store.record_fetch("yay", 12).unwrap();

        let record = store.get_record("yay").unwrap().unwrap();
        assert_eq!(record.fetch_count, 2);
        // total_requests only moves through touch_access.
        assert_eq!(record.total_requests, 1);
    }

    #[test]
    fn touch_access_is_noop_for_unknown_name() {
        let (_tmp, store) = open_store();
        store.touch_access("ghost").unwrap();
        assert!(store.get_record("ghost").unwrap().is_none());
    }

    #[test]
    fn touch_access_bumps_requests() {
        let (_tmp, store) = open_store();
        store.record_fetch("paru", 12).unwrap();
        store.touch_access("paru").unwrap();
        store.touch_access("paru").unwrap();

        let record = store.get_record("paru").unwrap().unwrap();
        assert_eq!(record.total_requests, 3);
        assert!(record.last_accessed >= record.fetched_at);
    }

    #[test]
    fn increment_fetch_counts_cache_hits() {
        let (_tmp, store) = open_store();
        store.record_fetch("paru", 12).unwrap();
        store.increment_fetch("paru").unwrap();

        let record = store.get_record("paru").unwrap().unwrap();
        assert_eq!(record.fetch_count, 2);
    }

    #[test]
    fn should_refresh_unknown_package() {
        let (_tmp, store) = open_store();
        assert!(store.should_refresh("never-seen").unwrap());
    }

    #[test]
    fn should_refresh_honours_ttl_boundary() {
        let (_tmp, store) = open_store();
        store.record_fetch("linux-ck", 12).unwrap();
        assert!(!store.should_refresh("linux-ck").unwrap());

        // One second inside the window: still fresh.
        store.backdate_fetch("linux-ck", 12 * 3600 - 1);
        assert!(!store.should_refresh("linux-ck").unwrap());

        // Exactly at the window: refresh.
        store.backdate_fetch("linux-ck", 1);
        assert!(store.should_refresh("linux-ck").unwrap());
    }

    #[test]
    fn fix_zero_counts_repairs_rows() {
        let (_tmp, store) = open_store();
        store.record_fetch("broken", 12).unwrap();
        store
            .conn()
            .execute(
                "UPDATE packages SET fetch_count = 0, total_requests = -3 WHERE name = 'broken'",
                [],
            )
            .unwrap();

        let repaired = store.fix_zero_counts().unwrap();
        assert_eq!(repaired, 2);

        let record = store.get_record("broken").unwrap().unwrap();
        assert_eq!(record.fetch_count, 1);
        assert_eq!(record.total_requests, 1);
    }

    #[test]
    fn top_queries_order_and_limit() {
        let (_tmp, store) = open_store();
        for name in ["a", "b", "c"] {
            store.record_fetch(name, 12).unwrap();
        }
        store.increment_fetch("b").unwrap();
        store.increment_fetch("b").unwrap();
        store.increment_fetch("c").unwrap();

        let top = store.top_fetched(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].name, "b");
        assert_eq!(top[0].count, 3);
        assert_eq!(top[1].name, "c");
    }

    #[test]
    fn stats_aggregates() {
        let (_tmp, store) = open_store();
        store.record_fetch("a", 12).unwrap();
        store.record_fetch("b", 12).unwrap();
        store.touch_access("a").unwrap();

        let totals = store.stats().unwrap();
        assert_eq!(totals.total_packages, 2);
        assert_eq!(totals.total_fetches, 2);
        assert_eq!(totals.total_requests, 3);
    }

    #[test]
    fn rpc_cache_round_trip() {
        let (_tmp, store) = open_store();
        store.rpc_cache_put("/rpc?type=search&arg=vim", b"{}").unwrap();
        let hit = store.rpc_cache_get("/rpc?type=search&arg=vim").unwrap();
        assert_eq!(hit.as_deref(), Some(b"{}".as_ref()));
    }

    #[test]
    fn rpc_cache_put_is_upsert() {
        let (_tmp, store) = open_store();
        store.rpc_cache_put("k", b"one").unwrap();
        store.rpc_cache_put("k", b"two").unwrap();
        assert_eq!(store.rpc_cache_get("k").unwrap().as_deref(), Some(b"two".as_ref()));
    }

    #[test]
    fn rpc_cache_expires_and_deletes() {
        let (_tmp, store) = open_store();
        store.rpc_cache_put("old", b"stale").unwrap();
        store.backdate_rpc_entry("old", RPC_CACHE_MAX_AGE_SECS + 1);

        assert!(store.rpc_cache_get("old").unwrap().is_none());
        // The row is gone, not just filtered.
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM rpc_cache WHERE key = 'old'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn cache_size_counts_recorded_packages_only() {
        let (tmp, store) = open_store();
        store.record_fetch("present", 12).unwrap();

        let pkg_dir = tmp.path().join("present");
        std::fs::create_dir_all(&pkg_dir).unwrap();
        std::fs::write(pkg_dir.join("PKGBUILD"), "pkgname=present\n").unwrap();

        // A directory without a metadata row is not counted.
        let stray = tmp.path().join("stray");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join("big"), vec![0u8; 4096]).unwrap();

        let rendered = store.cache_size().unwrap();
        assert_eq!(rendered, format_bytes(16));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn dir_size_nested() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(tmp.path().join("a.txt"), "aaa").unwrap();
        std::fs::write(sub.join("b.txt"), "bbbbb").unwrap();
        assert_eq!(dir_size(tmp.path()), 8);
    }
}
