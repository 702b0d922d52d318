//! Deterministic mapping from namespace + repository suffix to a mirror
//! directory.
//!
//! Mirrors live at `{data_root}/{namespace}/{suffix}.git`.  Staging clones are
//! built under `{data_root}/.partial/...` with the same relative layout and
//! renamed into place once complete; namespace prefixes can never start with
//! `.`, so the two trees never overlap.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::ProxyError;

const GIT_SUFFIX: &str = ".git";
const STAGING_DIR: &str = ".partial";

/// Canonical identity of one upstream repository, e.g. `github.com/org/repo.git`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirrorKey(String);

impl MirrorKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MirrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a mirror lives and what it is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorLocation {
    key: MirrorKey,
    /// Canonical repository suffix, always ending in `.git`.
    suffix: String,
    /// Absolute mirror directory.
    path: PathBuf,
    /// Scratch directory a fresh clone is built in.
    staging_path: PathBuf,
}

impl MirrorLocation {
    pub fn key(&self) -> &MirrorKey {
        &self.key
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }
}

/// Maps `(namespace, suffix)` pairs under a fixed data root.
#[derive(Debug, Clone)]
pub struct MirrorPathMapper {
    data_root: PathBuf,
}

impl MirrorPathMapper {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn staging_root(&self) -> PathBuf {
        self.data_root.join(STAGING_DIR)
    }

    /// Compute the mirror location.  Never touches the filesystem.
    pub fn map(
        &self,
        namespace_prefix: &str,
        repository_suffix: &str,
    ) -> Result<MirrorLocation, ProxyError> {
        let prefix_segments = checked_segments(namespace_prefix)?;
        if prefix_segments.iter().any(|seg| seg.ends_with(GIT_SUFFIX)) {
            return Err(ProxyError::InvalidPath(format!(
                "namespace {namespace_prefix:?} ends a segment in {GIT_SUFFIX}"
            )));
        }
        let suffix = canonical_suffix(repository_suffix)?;

        let mut relative = PathBuf::new();
        for seg in prefix_segments.iter().copied().chain(suffix.split('/')) {
            relative.push(seg);
        }

        // The joined path must stay a plain relative path.
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(ProxyError::InvalidPath(repository_suffix.to_string()));
        }

        let key = MirrorKey(format!("{}/{}", prefix_segments.join("/"), suffix));

        Ok(MirrorLocation {
            key,
            path: self.data_root.join(&relative),
            staging_path: self.staging_root().join(&relative),
            suffix,
        })
    }
}

/// Normalise a raw repository suffix: reject anything that could escape the
/// data root, drop `.` segments and end with exactly one `.git`.
pub(crate) fn canonical_suffix(raw: &str) -> Result<String, ProxyError> {
    if raw.starts_with('/') || raw.starts_with('\\') {
        return Err(ProxyError::InvalidPath(format!(
            "absolute repository path {raw:?}"
        )));
    }

    let segments = checked_segments(raw)?;
    let mut joined = segments.join("/");
    if let Some(stripped) = joined.strip_suffix(GIT_SUFFIX) {
        joined = stripped.to_string();
    }
    if joined.is_empty() || joined.ends_with('/') {
        return Err(ProxyError::InvalidPath(format!(
            "missing repository name in {raw:?}"
        )));
    }
    // A mirror directory must never sit inside another mirror.
    if let Some((parents, _)) = joined.rsplit_once('/') {
        if parents.split('/').any(|seg| seg.ends_with(GIT_SUFFIX)) {
            return Err(ProxyError::InvalidPath(format!(
                "repository path {raw:?} nests inside another repository"
            )));
        }
    }
    joined.push_str(GIT_SUFFIX);
    Ok(joined)
}

/// Split on `/`, dropping empty and `.` segments and rejecting the rest of
/// the dangerous ones.
fn checked_segments(raw: &str) -> Result<Vec<&str>, ProxyError> {
    let mut out = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                return Err(ProxyError::InvalidPath(format!(
                    "parent-directory segment in {raw:?}"
                )))
            }
            _ => {}
        }
        if seg.starts_with('.') {
            return Err(ProxyError::InvalidPath(format!(
                "hidden segment {seg:?} in {raw:?}"
            )));
        }
        if seg.contains('\\') || seg.chars().any(|c| c.is_control()) {
            return Err(ProxyError::InvalidPath(format!(
                "illegal character in {raw:?}"
            )));
        }
        if is_drive_prefix(seg) {
            return Err(ProxyError::InvalidPath(format!(
                "absolute repository path {raw:?}"
            )));
        }
        out.push(seg);
    }
    Ok(out)
}

fn is_drive_prefix(seg: &str) -> bool {
    let bytes = seg.as_bytes();
    bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
