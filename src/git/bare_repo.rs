//! Bare Git repository lifecycle on the local filesystem.
//!
//! Initialising a repository for a narrow first fetch, deciding whether a
//! directory is a usable mirror, and removing half-built ones.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, instrument, warn};

use super::commands::GitBinary;

// ---------------------------------------------------------------------------
// Init
// ---------------------------------------------------------------------------

/// Initialise a new bare Git repository at `path`.
///
/// Creates any missing parents and runs `git init --bare`.  If the directory
/// already contains a bare repo (has a `HEAD` file) this is a no-op.
#[instrument(skip(git), fields(path = %path.display()))]
pub async fn init_bare_repo(git: &GitBinary, path: &Path) -> Result<()> {
    if validate_bare_repo(path).await {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = git
        .command()
        .arg("init")
        .arg("--bare")
        .arg("--quiet")
        .arg(path)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Whether `path` looks like a usable bare Git repository: a directory with a
/// `HEAD` file.  A lightweight heuristic, not an integrity check.
#[instrument(fields(path = %path.display()))]
pub async fn validate_bare_repo(path: &Path) -> bool {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return false;
    }

    let head_exists = tokio::fs::metadata(path.join("HEAD"))
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !head_exists {
        debug!("HEAD file not found; not a valid bare repo");
        return false;
    }

    let objects_ok = tokio::fs::metadata(path.join("objects"))
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !objects_ok {
        warn!(path = %path.display(), "HEAD exists but objects/ is missing");
    }

    true
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

/// Recursively remove the directory at `path`.  Missing paths are a no-op.
#[instrument(fields(path = %path.display()))]
pub async fn remove_repo(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!("repo directory removed");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove directory: {}", path.display())),
    }
}

/// Whether any directory below `path` is itself a repository (has `HEAD`).
/// `path` itself is not considered.
#[instrument(fields(path = %path.display()))]
pub async fn contains_nested_repo(path: &Path) -> Result<bool> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || find_nested_repo_sync(&path))
        .await
        .context("blocking task panicked")?
        .context("failed to scan for nested repositories")
}

fn find_nested_repo_sync(root: &Path) -> Result<bool> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            if dir.join("HEAD").is_file() {
                return Ok(true);
            }
            stack.push(dir);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Stale lock files
// ---------------------------------------------------------------------------

/// Lock files git creates next to the repository root.
const ROOT_LOCK_FILES: &[&str] = &["HEAD.lock", "config.lock", "packed-refs.lock", "shallow.lock"];

/// Delete `*.lock` files a killed git process left in the repository.
///
/// Only safe while the caller holds the mirror's exclusive lock: with no git
/// process running against the repo, every lock file is stale.  Returns the
/// number of files removed.
#[instrument(fields(path = %path.display()))]
pub async fn remove_stale_lock_files(path: &Path) -> Result<usize> {
    let path = path.to_path_buf();

    // Walking refs/ is synchronous; run it in a blocking task to avoid
    // starving the Tokio runtime.
    let removed = tokio::task::spawn_blocking(move || remove_lock_files_sync(&path))
        .await
        .context("blocking task panicked")?
        .context("failed to remove stale lock files")?;

    if removed > 0 {
        warn!(removed, "removed stale git lock files");
    }
    Ok(removed)
}

fn remove_lock_files_sync(repo: &Path) -> Result<usize> {
    let mut removed = 0;

    for name in ROOT_LOCK_FILES {
        match std::fs::remove_file(repo.join(name)) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let mut stack = vec![repo.join("refs")];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if entry.file_name().to_string_lossy().ends_with(".lock") {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
