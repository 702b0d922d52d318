//! In-process [`VersionControl`] double for tests.
//!
//! Repositories are plain directories with a `HEAD` file; "upstream" is a set
//! of object ids plus a count of ref updates the next fetch will report.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};

use super::{FetchResult, ProtocolStream, VersionControl};
use crate::protocol::ProtocolRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchCall {
    pub repo: PathBuf,
    pub url: String,
    pub refspecs: Vec<String>,
    pub prune: bool,
}

#[derive(Debug, Default)]
struct Behaviour {
    clone_delay: Duration,
    fetch_delay: Duration,
    fail_clone: bool,
    fail_fetch: bool,
    fail_serve: bool,
    pending_updates: usize,
    upstream_objects: HashSet<String>,
    mirrored_objects: HashSet<String>,
    fetches: Vec<FetchCall>,
    occupy_during_clone: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct FakeGit {
    behaviour: Mutex<Behaviour>,
    clones: AtomicUsize,
    inits: AtomicUsize,
    object_checks: AtomicUsize,
    serves: AtomicUsize,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Behaviour) -> T) -> T {
        f(&mut self.behaviour.lock().unwrap())
    }

    pub fn set_clone_delay(&self, delay: Duration) {
        self.with(|b| b.clone_delay = delay);
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        self.with(|b| b.fetch_delay = delay);
    }

    pub fn fail_clones(&self, fail: bool) {
        self.with(|b| b.fail_clone = fail);
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.with(|b| b.fail_fetch = fail);
    }

    /// Create a non-empty directory at `path` while the next clone runs, as a
    /// competing writer outside the lock would.
    pub fn occupy_during_clone(&self, path: &Path) {
        self.with(|b| b.occupy_during_clone = Some(path.to_path_buf()));
    }

    pub fn fail_serves(&self, fail: bool) {
        self.with(|b| b.fail_serve = fail);
    }

    /// Make the next successful fetch report `n` updated refs.
    pub fn push_upstream_updates(&self, n: usize) {
        self.with(|b| b.pending_updates += n);
    }

    /// Add objects upstream; they become local after the next clone or fetch.
    pub fn add_upstream_objects(&self, oids: &[&str]) {
        self.with(|b| {
            b.upstream_objects
                .extend(oids.iter().map(|s| s.to_string()))
        });
    }

    pub fn clone_count(&self) -> usize {
        self.clones.load(Ordering::SeqCst)
    }

    pub fn init_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.with(|b| b.fetches.len())
    }

    pub fn fetch_calls(&self) -> Vec<FetchCall> {
        self.with(|b| b.fetches.clone())
    }

    pub fn object_check_count(&self) -> usize {
        self.object_checks.load(Ordering::SeqCst)
    }

    pub fn serve_count(&self) -> usize {
        self.serves.load(Ordering::SeqCst)
    }
}

fn make_repo(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path.join("objects"))?;
    std::fs::create_dir_all(path.join("refs"))?;
    std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n")?;
    Ok(())
}

#[async_trait::async_trait]
impl VersionControl for FakeGit {
    async fn clone_mirror(&self, url: &str, dest: &Path) -> Result<()> {
        self.clones.fetch_add(1, Ordering::SeqCst);
        let (delay, fail, occupy) =
            self.with(|b| (b.clone_delay, b.fail_clone, b.occupy_during_clone.take()));
        if dest.exists() {
            bail!("destination {} already exists", dest.display());
        }

        // Leave a half-written directory behind, as an interrupted clone would.
        std::fs::create_dir_all(dest.join("objects"))?;
        tokio::time::sleep(delay).await;
        if fail {
            bail!("fatal: could not read from remote repository {url}");
        }

        make_repo(dest)?;
        if let Some(path) = occupy {
            std::fs::create_dir_all(path.join("intruder"))?;
        }
        self.with(|b| {
            let upstream = b.upstream_objects.clone();
            b.mirrored_objects.extend(upstream);
            b.pending_updates = 0;
        });
        Ok(())
    }

    async fn init_bare(&self, dest: &Path) -> Result<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        make_repo(dest)
    }

    async fn fetch(
        &self,
        repo: &Path,
        url: &str,
        refspecs: &[String],
        prune: bool,
    ) -> Result<FetchResult> {
        let (delay, fail) = self.with(|b| (b.fetch_delay, b.fail_fetch));
        tokio::time::sleep(delay).await;
        self.with(|b| {
            b.fetches.push(FetchCall {
                repo: repo.to_path_buf(),
                url: url.to_string(),
                refspecs: refspecs.to_vec(),
                prune,
            })
        });
        if fail {
            bail!("fatal: unable to access '{url}': Could not resolve host");
        }
        if !repo.join("HEAD").is_file() {
            bail!("fatal: not a git repository: {}", repo.display());
        }

        let refs_updated = self.with(|b| {
            let upstream = b.upstream_objects.clone();
            b.mirrored_objects.extend(upstream);
            std::mem::take(&mut b.pending_updates)
        });
        Ok(FetchResult {
            refs_updated,
            objects_received: 0,
        })
    }

    async fn missing_objects(&self, _repo: &Path, oids: &[String]) -> Result<Vec<String>> {
        self.object_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.with(|b| {
            oids.iter()
                .filter(|oid| !b.mirrored_objects.contains(*oid))
                .cloned()
                .collect()
        }))
    }

    async fn serve(&self, repo: &Path, request: &ProtocolRequest) -> Result<ProtocolStream> {
        self.serves.fetch_add(1, Ordering::SeqCst);
        if self.with(|b| b.fail_serve) {
            bail!("git upload-pack failed (status 128): fatal: bad object");
        }
        if !repo.join("HEAD").is_file() {
            bail!("fatal: '{}' does not appear to be a git repository", repo.display());
        }
        let body = format!("{} {}", request.kind(), repo.display());
        Ok(Box::new(std::io::Cursor::new(body.into_bytes())))
    }

    async fn version(&self) -> Result<String> {
        Ok("git version 2.43.0 (fake)".to_string())
    }
}
