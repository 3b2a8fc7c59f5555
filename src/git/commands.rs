//! Git client command wrappers built on the subprocess runner.
//!
//! Every function shells out to the system `git` binary. `GIT_TERMINAL_PROMPT`
//! is left to the environment; the upstream index is public and anonymous.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, instrument};

use crate::runner::{self, CommandOutput};

/// Upstream clones that take longer than this are abandoned.
pub const CLONE_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `git clone <url> <dest>` with the mandatory 30-second deadline.
///
/// Returns the raw [`CommandOutput`]; callers decide whether a failed clone
/// is fatal (they usually try the mirror next).
#[instrument(fields(%url, dest = %dest.display()))]
pub async fn clone(url: &str, dest: &Path) -> Result<CommandOutput> {
    let dest_str = path_str(dest)?;
    let output = runner::run_batched(
        "git",
        &["clone", url, dest_str],
        None,
        None,
        Some(CLONE_TIMEOUT),
    )
    .await
    .context("failed to run git clone")?;

    debug!(ok = output.ok, "git clone finished");
    Ok(output)
}

/// Run `git clone --branch <branch> --single-branch <url> <dest>` against an
/// aggregate mirror where each package lives on its own branch.
#[instrument(fields(%url, %branch, dest = %dest.display()))]
pub async fn clone_branch(url: &str, branch: &str, dest: &Path) -> Result<CommandOutput> {
    let dest_str = path_str(dest)?;
    let output = runner::run_batched(
        "git",
        &["clone", "--branch", branch, "--single-branch", url, dest_str],
        None,
        None,
        Some(CLONE_TIMEOUT),
    )
    .await
    .context("failed to run git clone --branch")?;

    debug!(ok = output.ok, "mirror clone finished");
    Ok(output)
}

/// Run `git pull` inside `repo_path`.
#[instrument(fields(repo = %repo_path.display()))]
pub async fn pull(repo_path: &Path) -> Result<CommandOutput> {
    let output = runner::run_batched(
        "git",
        &["pull"],
        Some(repo_path),
        None,
        Some(CLONE_TIMEOUT),
    )
    .await
    .context("failed to run git pull")?;

    debug!(ok = output.ok, "git pull finished");
    Ok(output)
}

/// Run `git config <key> <value>` inside `repo_path`, failing loudly: config
/// is only written right after a validated clone, where failure means the
/// repository is not usable.
#[instrument(fields(repo = %repo_path.display(), %key, %value))]
pub async fn set_config(repo_path: &Path, key: &str, value: &str) -> Result<()> {
    let output = runner::run_batched(
        "git",
        &["config", key, value],
        Some(repo_path),
        None,
        None,
    )
    .await
    .context("failed to run git config")?;

    if !output.ok {
        bail!(
            "git config {key} failed (exit {:?}): {}",
            output.exit_code,
            output.stderr_text(),
        );
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}
