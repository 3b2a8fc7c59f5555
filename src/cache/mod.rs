//! Local package cache management.
//!
//! Provides a [`PackageCache`] that owns the on-disk repository cache: lazy
//! materialization from the upstream index (with mirror fallback), TTL-driven
//! refresh, and per-name locking so concurrent requests for one package
//! never race a clone.

pub mod manager;

pub use manager::{EnsuredRepo, Freshness, PackageCache, RepositoryInfo};
