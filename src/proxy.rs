//! Request orchestration: resolve, map, lock, materialize, unlock, serve.
//!
//! The mirror lock is held only while the mirror is being brought up to date.
//! `upload-pack` runs after the guard is dropped, so a slow client never
//! blocks other requests for the same repository.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::ProxyError;
use crate::git::{ProtocolStream, VersionControl};
use crate::metrics::{MaterializeOutcome, Metrics};
use crate::mirror::{
    Materializer, MaterializerLimits, MirrorLocation, MirrorLockRegistry, MirrorPathMapper,
    NamespaceResolver, Ready, RefSpec,
};
use crate::protocol::ProtocolRequest;

/// A request resolved to its mirror and upstream.
#[derive(Debug, Clone)]
pub struct Target {
    pub location: MirrorLocation,
    pub upstream_url: String,
}

/// Successful outcome of [`MirrorProxy::handle`].
pub struct Served {
    pub stream: ProtocolStream,
    /// The refresh failed and the response comes from the previous mirror state.
    pub stale: bool,
}

impl fmt::Debug for Served {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Served")
            .field("stale", &self.stale)
            .finish_non_exhaustive()
    }
}

pub struct MirrorProxy {
    resolver: NamespaceResolver,
    mapper: MirrorPathMapper,
    locks: MirrorLockRegistry,
    materializer: Materializer,
    vcs: Arc<dyn VersionControl>,
    lock_wait_timeout: Duration,
    serve_stale_on_refresh_failure: bool,
    metrics: Arc<Metrics>,
}

impl MirrorProxy {
    pub fn from_config(
        config: &Config,
        vcs: Arc<dyn VersionControl>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let resolver = NamespaceResolver::new(&config.namespaces).map_err(anyhow::Error::msg)?;
        Ok(Self {
            resolver,
            mapper: MirrorPathMapper::new(&config.storage.local.path),
            locks: MirrorLockRegistry::new(),
            materializer: Materializer::new(
                Arc::clone(&vcs),
                MaterializerLimits::from(&config.clone),
                Arc::clone(&metrics),
            ),
            vcs,
            lock_wait_timeout: config.clone.lock_wait_timeout(),
            serve_stale_on_refresh_failure: config.clone.serve_stale_on_refresh_failure,
            metrics,
        })
    }

    /// Resolve `repo_path` (e.g. `github.com/org/repo.git`) to a mirror and
    /// upstream URL.  Pure: no filesystem access.
    pub fn locate(&self, repo_path: &str) -> Result<Target, ProxyError> {
        let resolution = self.resolver.resolve(repo_path).inspect_err(|_| {
            debug!(path = %repo_path, "no namespace for request path");
        })?;

        let location = self
            .mapper
            .map(&resolution.prefix, &resolution.repository_suffix)
            .inspect_err(|e| {
                warn!(path = %repo_path, error = %e, "rejected repository path");
            })?;

        let upstream_url = format!("{}/{}", resolution.upstream_base, location.suffix());
        Ok(Target {
            location,
            upstream_url,
        })
    }

    /// Bring the mirror for `repo_path` up to date for `request`, then serve
    /// it.
    #[instrument(skip(self, request), fields(kind = request.kind()))]
    pub async fn handle(
        &self,
        repo_path: &str,
        request: ProtocolRequest,
    ) -> Result<Served, ProxyError> {
        let Target {
            location,
            upstream_url,
        } = self.locate(repo_path)?;
        let refspec = RefSpec::from_request(&request)?;
        debug!(key = %location.key(), %refspec, "derived refspec");

        let acquired = self
            .locks
            .acquire_timeout(location.key(), self.lock_wait_timeout)
            .await;
        self.metrics.lock_handles.set(self.locks.len() as i64);
        let (guard, contended) = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                self.metrics.lock_timeouts.inc();
                return Err(e);
            }
        };
        self.metrics.lock_acquisitions.inc();
        if contended {
            self.metrics.lock_waits.inc();
        }

        let stale = match self
            .materializer
            .materialize(&location, &upstream_url, &refspec, &guard)
            .await
        {
            Ok(ready) => {
                self.metrics.record_materialize(match ready {
                    Ready::Cloned => MaterializeOutcome::Cloned,
                    Ready::Refreshed { .. } => MaterializeOutcome::Refreshed,
                    Ready::Unchanged => MaterializeOutcome::Unchanged,
                });
                debug!(?ready, "mirror ready");
                false
            }
            Err(e) if self.serve_stale_on_refresh_failure && e.mirror_present() => {
                self.metrics.record_materialize(MaterializeOutcome::Failed);
                self.metrics.stale_serves.inc();
                warn!(key = %location.key(), error = %e, "refresh failed; serving stale mirror");
                true
            }
            Err(e) => {
                self.metrics.record_materialize(MaterializeOutcome::Failed);
                return Err(e.into());
            }
        };
        drop(guard);

        let stream = self
            .vcs
            .serve(location.path(), &request)
            .await
            .map_err(ProxyError::ProtocolServe)?;

        Ok(Served { stream, stale })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
