use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    /// Request-path prefix to upstream base URL mapping, longest prefix wins.
    pub namespaces: Vec<NamespaceConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub clone: CloneConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    pub http_listen: String,
    /// Upper bound on an inflated `git-upload-pack` request body.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

fn default_max_request_bytes() -> usize {
    64 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Namespaces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceConfig {
    /// Leading request-path segment(s), e.g. `github.com` or `github.com/acme`.
    pub prefix: String,
    /// Base URL the repository suffix is appended to, e.g. `https://github.com`.
    pub upstream: String,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub local: LocalStorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    /// Root directory holding one bare mirror per repository.
    pub path: String,
}

// ---------------------------------------------------------------------------
// Git binary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Path (or `PATH`-resolved name) of the git executable.
    #[serde(default = "default_git_binary")]
    pub binary: String,
    /// Extra environment for every git invocation, e.g. `GIT_SSH_COMMAND`.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            env: BTreeMap::new(),
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

// ---------------------------------------------------------------------------
// Clone / fetch behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CloneConfig {
    /// Upper bound (seconds) on a single upstream clone.
    #[serde(default = "default_clone_timeout")]
    pub clone_timeout: u64,
    /// Upper bound (seconds) on a single upstream fetch.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// How long (seconds) a request waits for a busy mirror before giving up.
    #[serde(default = "default_lock_wait_timeout")]
    pub lock_wait_timeout: u64,
    /// Semaphore limit for concurrent clones against upstream.
    #[serde(default = "default_max_concurrent_upstream_clones")]
    pub max_concurrent_upstream_clones: usize,
    /// Semaphore limit for concurrent fetches against upstream.
    #[serde(default = "default_max_concurrent_upstream_fetches")]
    pub max_concurrent_upstream_fetches: usize,
    /// Serve the existing mirror (flagged stale) when refreshing it fails.
    #[serde(default)]
    pub serve_stale_on_refresh_failure: bool,
}

impl CloneConfig {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout)
    }

    pub fn lock_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_wait_timeout)
    }
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            clone_timeout: default_clone_timeout(),
            fetch_timeout: default_fetch_timeout(),
            lock_wait_timeout: default_lock_wait_timeout(),
            max_concurrent_upstream_clones: default_max_concurrent_upstream_clones(),
            max_concurrent_upstream_fetches: default_max_concurrent_upstream_fetches(),
            serve_stale_on_refresh_failure: false,
        }
    }
}

fn default_clone_timeout() -> u64 {
    1800
}

fn default_fetch_timeout() -> u64 {
    600
}

fn default_lock_wait_timeout() -> u64 {
    1800
}

fn default_max_concurrent_upstream_clones() -> usize {
    4
}

fn default_max_concurrent_upstream_fetches() -> usize {
    8
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents)
        .with_context(|| format!("failed to load config file: {}", path.display()))
}

/// Parse and validate a [`Config`] from YAML text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("invalid YAML configuration")?;
    validate_config(&config)?;
    Ok(config)
}

/// Sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.namespaces.is_empty(),
        "at least one namespace must be configured"
    );

    let mut seen = HashSet::new();
    for ns in &config.namespaces {
        let prefix = crate::mirror::namespace::normalize_prefix(&ns.prefix);
        anyhow::ensure!(!prefix.is_empty(), "namespace prefix must not be empty");
        anyhow::ensure!(
            prefix
                .split('/')
                .all(|seg| !seg.starts_with('.') && !seg.contains('\\') && !seg.contains('\0')),
            "namespace prefix {:?} contains a hidden or invalid segment",
            ns.prefix
        );
        anyhow::ensure!(
            prefix.split('/').all(|seg| !seg.ends_with(".git")),
            "namespace prefix {:?} must not contain a segment ending in .git",
            ns.prefix
        );
        anyhow::ensure!(
            !ns.upstream.trim().is_empty(),
            "namespace {:?} has an empty upstream",
            ns.prefix
        );
        anyhow::ensure!(
            seen.insert(prefix.clone()),
            "namespace prefix {prefix:?} is configured more than once"
        );
    }

    anyhow::ensure!(
        !config.storage.local.path.trim().is_empty(),
        "storage.local.path must not be empty"
    );
    anyhow::ensure!(
        config.clone.clone_timeout > 0
            && config.clone.fetch_timeout > 0
            && config.clone.lock_wait_timeout > 0,
        "clone timeouts must be greater than zero"
    );
    anyhow::ensure!(
        config.clone.max_concurrent_upstream_clones > 0
            && config.clone.max_concurrent_upstream_fetches > 0,
        "upstream concurrency limits must be greater than zero"
    );
    anyhow::ensure!(
        config.proxy.max_request_bytes > 0,
        "proxy.max_request_bytes must be greater than zero"
    );

    if config.clone.lock_wait_timeout < config.clone.clone_timeout {
        tracing::warn!(
            lock_wait_timeout = config.clone.lock_wait_timeout,
            clone_timeout = config.clone.clone_timeout,
            "lock_wait_timeout is shorter than clone_timeout; waiters may give up on slow clones"
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
proxy:
  http_listen: "127.0.0.1:8080"
namespaces:
  - prefix: github.com
    upstream: https://github.com
storage:
  local:
    path: /var/cache/mirrorcache
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.git.binary, "git");
        assert_eq!(config.clone.fetch_timeout, 600);
        assert!(config.clone.lock_wait_timeout >= config.clone.clone_timeout);
        assert_eq!(config.clone.max_concurrent_upstream_clones, 4);
        assert!(!config.clone.serve_stale_on_refresh_failure);
        assert_eq!(config.proxy.max_request_bytes, 64 * 1024 * 1024);
    }

    #[test]
    fn full_config_parses() {
        let yaml = r#"
proxy:
  http_listen: "0.0.0.0:9000"
  max_request_bytes: 1024
namespaces:
  - prefix: github.com
    upstream: https://github.com
  - prefix: github.com/acme
    upstream: git@github.com:acme
storage:
  local:
    path: /srv/mirrors
git:
  binary: /usr/bin/git
  env:
    GIT_SSH_COMMAND: "ssh -i /etc/mirrorcache/id_ed25519"
clone:
  clone_timeout: 60
  fetch_timeout: 30
  lock_wait_timeout: 120
  serve_stale_on_refresh_failure: true
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.namespaces.len(), 2);
        assert_eq!(config.git.env.len(), 1);
        assert_eq!(config.clone.fetch_timeout(), Duration::from_secs(30));
        assert!(config.clone.serve_stale_on_refresh_failure);
    }

    #[test]
    fn duplicate_prefixes_rejected() {
        let yaml = r#"
proxy: { http_listen: "127.0.0.1:8080" }
namespaces:
  - { prefix: github.com, upstream: https://github.com }
  - { prefix: /github.com/, upstream: https://mirror.example.com }
storage: { local: { path: /tmp/m } }
"#;
        let err = parse_config(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("more than once"));
    }

    #[test]
    fn hidden_prefix_rejected() {
        let yaml = r#"
proxy: { http_listen: "127.0.0.1:8080" }
namespaces:
  - { prefix: .partial, upstream: https://github.com }
storage: { local: { path: /tmp/m } }
"#;
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn repository_like_prefix_rejected() {
        let yaml = r#"
proxy: { http_listen: "127.0.0.1:8080" }
namespaces:
  - { prefix: github.com/org/repo.git, upstream: https://github.com/org/repo.git }
storage: { local: { path: /tmp/m } }
"#;
        let err = parse_config(yaml).unwrap_err();
        assert!(format!("{err:#}").contains(".git"));
    }

    #[test]
    fn empty_namespaces_rejected() {
        let yaml = r#"
proxy: { http_listen: "127.0.0.1:8080" }
namespaces: []
storage: { local: { path: /tmp/m } }
"#;
        assert!(parse_config(yaml).is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let yaml = format!("{MINIMAL}clone:\n  fetch_timeout: 0\n");
        assert!(parse_config(&yaml).is_err());
    }
}
