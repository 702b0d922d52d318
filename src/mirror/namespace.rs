//! Request-path to upstream mapping.
//!
//! A namespace is a leading run of path segments (e.g. `github.com` or
//! `github.com/acme`) bound to an upstream base URL.  Resolution picks the
//! longest configured prefix that matches on whole segments.

use crate::config::NamespaceConfig;
use crate::error::ProxyError;

/// One configured `prefix -> upstream base` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub prefix: String,
    pub upstream_base: String,
}

/// Result of matching a request path against the namespace table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub prefix: String,
    pub upstream_base: String,
    /// Path remainder after the prefix, slashes collapsed, not yet validated.
    pub repository_suffix: String,
}

/// Immutable longest-prefix lookup table.
#[derive(Debug, Clone)]
pub struct NamespaceResolver {
    /// Sorted by descending segment count so the first hit is the longest.
    entries: Vec<Namespace>,
}

impl NamespaceResolver {
    pub fn new(namespaces: &[NamespaceConfig]) -> Result<Self, String> {
        let mut entries: Vec<Namespace> = Vec::with_capacity(namespaces.len());
        for ns in namespaces {
            let prefix = normalize_prefix(&ns.prefix);
            if prefix.is_empty() {
                return Err("namespace prefix must not be empty".to_string());
            }
            if entries.iter().any(|e| e.prefix == prefix) {
                return Err(format!("duplicate namespace prefix {prefix:?}"));
            }
            entries.push(Namespace {
                prefix,
                upstream_base: ns.upstream.trim().trim_end_matches('/').to_string(),
            });
        }
        entries.sort_by(|a, b| {
            segment_count(&b.prefix)
                .cmp(&segment_count(&a.prefix))
                .then_with(|| a.prefix.cmp(&b.prefix))
        });
        Ok(Self { entries })
    }

    /// Match `request_path` (e.g. `/github.com/org/repo.git`) to a namespace.
    pub fn resolve(&self, request_path: &str) -> Result<Resolution, ProxyError> {
        let path = collapse_slashes(request_path);

        for ns in &self.entries {
            let remainder = if path == ns.prefix {
                Some("")
            } else {
                path.strip_prefix(ns.prefix.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
            };

            if let Some(rest) = remainder {
                return Ok(Resolution {
                    prefix: ns.prefix.clone(),
                    upstream_base: ns.upstream_base.clone(),
                    repository_suffix: rest.to_string(),
                });
            }
        }

        Err(ProxyError::NotFound(request_path.to_string()))
    }
}

/// Canonical form of a configured prefix: no leading, trailing or repeated
/// slashes.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    collapse_slashes(prefix.trim())
}

/// Join non-empty `/`-separated segments back together.
pub(crate) fn collapse_slashes(path: &str) -> String {
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn segment_count(prefix: &str) -> usize {
    prefix.split('/').count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
