//! Git client wrappers and smart HTTP protocol plumbing.
//!
//! All repository mutation shells out to the system `git` binary through the
//! subprocess runner; `proto` handles the wire-level concerns (packet-line
//! framing, request classification, git-dir path mapping).

pub mod commands;
pub mod proto;
