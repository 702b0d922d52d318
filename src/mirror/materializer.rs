//! Clone-if-absent / refresh-if-present.
//!
//! [`Materializer::materialize`] takes a [`MirrorGuard`] so it can only run
//! while the caller holds the mirror's lock.  Fresh clones are built in the
//! staging tree and renamed into place, so the mirror path holds either
//! nothing or a complete repository.  A directory at the mirror path without
//! `HEAD` predates that rule (or was tampered with) and is swept like a
//! staging leftover, unless another mirror lives inside it.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::locks::MirrorGuard;
use super::path::MirrorLocation;
use super::refspec::RefSpec;
use crate::config::CloneConfig;
use crate::error::FetchError;
use crate::git::{
    contains_nested_repo, remove_repo, remove_stale_lock_files, validate_bare_repo, VersionControl,
};
use crate::metrics::Metrics;

/// What materialization did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    /// Mirror did not exist and was cloned.
    Cloned,
    /// Mirror existed and the fetch moved `refs_updated` refs.
    Refreshed { refs_updated: usize },
    /// Mirror existed and needed nothing from upstream.
    Unchanged,
}

/// Timeouts and upstream concurrency bounds.
#[derive(Debug, Clone, Copy)]
pub struct MaterializerLimits {
    pub clone_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_concurrent_clones: usize,
    pub max_concurrent_fetches: usize,
}

impl From<&CloneConfig> for MaterializerLimits {
    fn from(config: &CloneConfig) -> Self {
        Self {
            clone_timeout: config.clone_timeout(),
            fetch_timeout: config.fetch_timeout(),
            max_concurrent_clones: config.max_concurrent_upstream_clones,
            max_concurrent_fetches: config.max_concurrent_upstream_fetches,
        }
    }
}

pub struct Materializer {
    vcs: Arc<dyn VersionControl>,
    limits: MaterializerLimits,
    /// Semaphore limiting concurrent full clones against upstream.
    clone_semaphore: Arc<Semaphore>,
    /// Semaphore limiting concurrent fetches against upstream.
    fetch_semaphore: Arc<Semaphore>,
    metrics: Arc<Metrics>,
}

impl Materializer {
    pub fn new(
        vcs: Arc<dyn VersionControl>,
        limits: MaterializerLimits,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            vcs,
            clone_semaphore: Arc::new(Semaphore::new(limits.max_concurrent_clones)),
            fetch_semaphore: Arc::new(Semaphore::new(limits.max_concurrent_fetches)),
            limits,
            metrics,
        }
    }

    /// Make the mirror at `location` ready to serve `refspec`.
    #[instrument(skip_all, fields(key = %location.key(), %refspec))]
    pub async fn materialize(
        &self,
        location: &MirrorLocation,
        upstream_url: &str,
        refspec: &RefSpec,
        guard: &MirrorGuard,
    ) -> Result<Ready, FetchError> {
        debug_assert_eq!(guard.key(), location.key(), "guard for a different mirror");

        if validate_bare_repo(location.path()).await {
            self.refresh(location.path(), upstream_url, refspec).await
        } else {
            self.clone_fresh(location, upstream_url, refspec).await
        }
    }

    // -----------------------------------------------------------------------
    // Absent
    // -----------------------------------------------------------------------

    async fn clone_fresh(
        &self,
        location: &MirrorLocation,
        upstream_url: &str,
        refspec: &RefSpec,
    ) -> Result<Ready, FetchError> {
        let clone_err = |source: anyhow::Error| FetchError::Clone {
            url: upstream_url.to_string(),
            source,
        };

        if tokio::fs::symlink_metadata(location.path()).await.is_ok() {
            if contains_nested_repo(location.path())
                .await
                .map_err(clone_err)?
            {
                return Err(clone_err(anyhow::anyhow!(
                    "{} holds another mirror; refusing to clone over it",
                    location.path().display()
                )));
            }
            warn!(path = %location.path().display(), "sweeping incomplete mirror directory");
            remove_repo(location.path()).await.map_err(clone_err)?;
        }
        // Leftover from a crash or a cancelled request.
        remove_repo(location.staging_path())
            .await
            .map_err(clone_err)?;

        let _permit = self
            .clone_semaphore
            .acquire()
            .await
            .map_err(|e| clone_err(e.into()))?;

        info!(url = %upstream_url, "cloning mirror");
        let staging = location.staging_path();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.limits.clone_timeout,
            self.build_clone(staging, upstream_url, refspec),
        )
        .await;
        self.metrics
            .clone_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(clone_err(e)),
            Err(_) => Some(FetchError::TimedOut {
                operation: "clone",
                url: upstream_url.to_string(),
                after: self.limits.clone_timeout,
                mirror_present: false,
            }),
        };
        if let Some(err) = failure {
            warn!(error = %err, "clone failed; removing staging directory");
            if let Err(e) = remove_repo(staging).await {
                warn!(error = %e, "failed to remove staging directory");
            }
            return Err(err);
        }

        if let Some(parent) = location.path().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if let Err(e) = tokio::fs::rename(staging, location.path()).await {
            if let Err(cleanup) = remove_repo(staging).await {
                warn!(error = %cleanup, "failed to remove staging directory");
            }
            return Err(e.into());
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "mirror cloned"
        );
        Ok(Ready::Cloned)
    }

    async fn build_clone(
        &self,
        staging: &Path,
        upstream_url: &str,
        refspec: &RefSpec,
    ) -> anyhow::Result<()> {
        if refspec.is_full() {
            return self.vcs.clone_mirror(upstream_url, staging).await;
        }

        // Narrow first fetch: an empty repository plus only the requested refs.
        self.vcs.init_bare(staging).await?;
        let result = self
            .vcs
            .fetch(staging, upstream_url, &refspec.fetch_refspecs(), false)
            .await?;
        debug!(refs = result.refs_updated, "narrow clone fetched");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Present
    // -----------------------------------------------------------------------

    async fn refresh(
        &self,
        mirror: &Path,
        upstream_url: &str,
        refspec: &RefSpec,
    ) -> Result<Ready, FetchError> {
        let refresh_err = |source: anyhow::Error| FetchError::Refresh {
            url: upstream_url.to_string(),
            source,
        };

        if let RefSpec::Objects(oids) = refspec {
            if oids.is_empty() {
                return Ok(Ready::Unchanged);
            }
            let missing = self
                .vcs
                .missing_objects(mirror, oids)
                .await
                .map_err(refresh_err)?;
            if missing.is_empty() {
                debug!(wanted = oids.len(), "all wanted objects already mirrored");
                return Ok(Ready::Unchanged);
            }
            debug!(missing = missing.len(), "wanted objects missing; refreshing all refs");
        }

        remove_stale_lock_files(mirror).await.map_err(refresh_err)?;

        let _permit = self
            .fetch_semaphore
            .acquire()
            .await
            .map_err(|e| refresh_err(e.into()))?;

        let refspecs = refspec.fetch_refspecs();
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.limits.fetch_timeout,
            self.vcs
                .fetch(mirror, upstream_url, &refspecs, refspec.is_full()),
        )
        .await;
        self.metrics
            .fetch_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(result)) if result.refs_updated == 0 => Ok(Ready::Unchanged),
            Ok(Ok(result)) => {
                info!(
                    refs_updated = result.refs_updated,
                    objects = result.objects_received,
                    "mirror refreshed"
                );
                Ok(Ready::Refreshed {
                    refs_updated: result.refs_updated,
                })
            }
            Ok(Err(e)) => Err(refresh_err(e)),
            Err(_) => Err(FetchError::TimedOut {
                operation: "fetch",
                url: upstream_url.to_string(),
                after: self.limits.fetch_timeout,
                mirror_present: true,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
