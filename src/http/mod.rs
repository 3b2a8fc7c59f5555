//! HTTP layer for the caching proxy.
//!
//! An axum-based server with three request lanes: Git smart HTTP traffic
//! (classified by path shape and served from the local repository cache),
//! the upstream-compatible RPC endpoint, and read-only statistics.

pub mod gateway;
pub mod handler;
