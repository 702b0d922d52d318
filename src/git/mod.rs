//! Git command wrappers and bare repository management.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.  The rest of the crate talks to git through the
//! [`VersionControl`] trait so the mirror logic can be exercised without a
//! network or a git installation.

pub mod bare_repo;
pub mod commands;
#[cfg(test)]
pub mod fake;

use std::path::Path;

use anyhow::Result;

pub use bare_repo::{
    contains_nested_repo, init_bare_repo, remove_repo, remove_stale_lock_files, validate_bare_repo,
};
pub use commands::{
    git_clone_mirror, git_fetch_refspecs, git_missing_objects, git_upload_pack_streamed,
    git_version, FetchResult, GitBinary, ProtocolStream,
};

use crate::protocol::ProtocolRequest;

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The git operations the mirror cache relies on.
#[async_trait::async_trait]
pub trait VersionControl: Send + Sync {
    /// Full mirror clone of `url` into `dest` (which must not exist).
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()>;

    /// Create an empty bare repository at `dest`.
    async fn init_bare(&self, dest: &Path) -> Result<()>;

    /// Fetch `refspecs` from `url` into the bare repository at `repo`.
    async fn fetch(
        &self,
        repo: &Path,
        url: &str,
        refspecs: &[String],
        prune: bool,
    ) -> Result<FetchResult>;

    /// Which of `oids` the repository at `repo` lacks.
    async fn missing_objects(&self, repo: &Path, oids: &[String]) -> Result<Vec<String>>;

    /// Run `upload-pack` for `request` against the repository at `repo`.
    async fn serve(&self, repo: &Path, request: &ProtocolRequest) -> Result<ProtocolStream>;

    /// Version string of the underlying tool, for health reporting.
    async fn version(&self) -> Result<String>;
}

// ---------------------------------------------------------------------------
// git CLI implementation
// ---------------------------------------------------------------------------

/// [`VersionControl`] backed by the system `git` binary.
#[derive(Debug, Clone)]
pub struct GitCli {
    git: GitBinary,
}

impl GitCli {
    pub fn new(git: GitBinary) -> Self {
        Self { git }
    }
}

#[async_trait::async_trait]
impl VersionControl for GitCli {
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        git_clone_mirror(&self.git, url, dest).await
    }

    async fn init_bare(&self, dest: &Path) -> Result<()> {
        init_bare_repo(&self.git, dest).await
    }

    async fn fetch(
        &self,
        repo: &Path,
        url: &str,
        refspecs: &[String],
        prune: bool,
    ) -> Result<FetchResult> {
        git_fetch_refspecs(&self.git, repo, url, refspecs, prune).await
    }

    async fn missing_objects(&self, repo: &Path, oids: &[String]) -> Result<Vec<String>> {
        git_missing_objects(&self.git, repo, oids).await
    }

    async fn serve(&self, repo: &Path, request: &ProtocolRequest) -> Result<ProtocolStream> {
        let input = match request {
            ProtocolRequest::Advertise { .. } => None,
            ProtocolRequest::UploadPack { body, .. } => Some(body.clone()),
        };
        git_upload_pack_streamed(&self.git, repo, request.protocol().as_env(), input).await
    }

    async fn version(&self) -> Result<String> {
        git_version(&self.git).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
