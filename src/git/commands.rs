//! Git command wrappers using [`tokio::process::Command`].
//!
//! Every function in this module shells out to the configured `git` binary.
//! Extra environment (`GIT_SSH_COMMAND`, credential helpers, ...) comes from
//! [`GitBinary`] so that upstream credentials stay transparent to callers.
//!
//! Children are spawned with `kill_on_drop(true)`: dropping the returned
//! future (request cancelled, timeout elapsed) kills the subprocess.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::GitConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The git executable plus the environment every invocation gets.
#[derive(Debug, Clone)]
pub struct GitBinary {
    program: String,
    env: Vec<(String, String)>,
}

impl GitBinary {
    pub fn new(program: impl Into<String>, env: Vec<(String, String)>) -> Self {
        Self {
            program: program.into(),
            env,
        }
    }

    pub fn from_config(config: &GitConfig) -> Self {
        Self::new(
            config.binary.clone(),
            config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub(super) fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

/// Summary of a `git fetch` operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    /// Number of refs that were created, changed or pruned.
    pub refs_updated: usize,
    /// Object count reported by the remote (`Total N`), 0 when not reported.
    pub objects_received: u64,
}

/// Byte stream produced by `git upload-pack`.
pub type ProtocolStream = Box<dyn AsyncRead + Send + Unpin>;

// ---------------------------------------------------------------------------
// Clone
// ---------------------------------------------------------------------------

/// Run `git clone --mirror -- <url> <dest>`.
#[instrument(skip(git), fields(%url, dest = %dest.display()))]
pub async fn git_clone_mirror(git: &GitBinary, url: &str, dest: &Path) -> Result<()> {
    let mut cmd = git.command();
    cmd.arg("clone")
        .arg("--mirror")
        .arg("--")
        .arg(url)
        .arg(dest);

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!("spawning git clone --mirror");

    let output = cmd
        .output()
        .await
        .context("failed to spawn git clone --mirror")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone --mirror failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("git clone --mirror succeeded");
    Ok(())
}

// ---------------------------------------------------------------------------
// Fetch
// ---------------------------------------------------------------------------

/// Run `git fetch <url> --stdin` inside an existing bare repo, feeding
/// `refspecs` on stdin so no client-derived value reaches the argument list.
///
/// `prune` removes local refs that no longer exist upstream; only sensible
/// for full-mirror refspecs.
#[instrument(skip(git), fields(repo = %repo_path.display(), %remote_url))]
pub async fn git_fetch_refspecs(
    git: &GitBinary,
    repo_path: &Path,
    remote_url: &str,
    refspecs: &[String],
    prune: bool,
) -> Result<FetchResult> {
    let mut cmd = git.command();
    cmd.arg("-C")
        .arg(repo_path)
        .arg("fetch")
        .arg("--no-write-fetch-head")
        .arg("--no-show-forced-updates")
        .arg("--force");
    if prune {
        cmd.arg("--prune");
    }
    cmd.arg("--stdin").arg("--").arg(remote_url);

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    debug!(refspec_count = refspecs.len(), "spawning git fetch");

    let mut child = cmd.spawn().context("failed to spawn git fetch")?;

    let mut input = String::new();
    for spec in refspecs {
        input.push_str(spec);
        input.push('\n');
    }
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .context("failed to write refspecs to git fetch stdin")?;
        drop(stdin);
    }

    let output = child
        .wait_with_output()
        .await
        .context("failed to wait for git fetch")?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        bail!(
            "git fetch failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    let result = FetchResult {
        refs_updated: count_updated_refs(&stderr),
        objects_received: parse_objects_received(&stderr),
    };

    debug!(
        refs_updated = result.refs_updated,
        objects_received = result.objects_received,
        "git fetch complete"
    );

    Ok(result)
}

/// Count the ref-update lines in `git fetch` stderr.
///
/// Lines matching patterns like `abc..def main -> main` or
/// `* [new branch] x -> x` are counted; `From <url>` is not.
fn count_updated_refs(stderr: &str) -> usize {
    stderr
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.contains("->") && !trimmed.starts_with("From")
        })
        .count()
}

/// Parse the `remote: Total N (...)` line from `git fetch` stderr.
/// Returns 0 if the line is not found or cannot be parsed.
fn parse_objects_received(stderr: &str) -> u64 {
    for line in stderr.lines() {
        let Some(rest) = line.trim().split("Total").nth(1) else {
            continue;
        };
        for token in rest.split_whitespace() {
            if let Ok(n) = token
                .trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
            {
                return n;
            }
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Object presence
// ---------------------------------------------------------------------------

/// Return the subset of `oids` that the repository does not contain, using
/// `git cat-file --batch-check`.
#[instrument(skip(git, oids), fields(repo = %repo_path.display(), count = oids.len()))]
pub async fn git_missing_objects(
    git: &GitBinary,
    repo_path: &Path,
    oids: &[String],
) -> Result<Vec<String>> {
    if oids.is_empty() {
        return Ok(Vec::new());
    }

    let mut cmd = git.command();
    cmd.arg("-C")
        .arg(repo_path)
        .arg("cat-file")
        .arg("--batch-check");

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn git cat-file")?;

    // Feed stdin from a separate task: cat-file answers line by line and
    // would otherwise block on a full stdout pipe.
    let mut input = String::with_capacity(oids.len() * 41);
    for oid in oids {
        input.push_str(oid);
        input.push('\n');
    }
    let stdin = child.stdin.take().context("git cat-file stdin missing")?;
    let writer = tokio::spawn(async move {
        let mut stdin = stdin;
        stdin.write_all(input.as_bytes()).await
    });

    let output = child
        .wait_with_output()
        .await
        .context("failed to wait for git cat-file")?;
    writer
        .await
        .context("git cat-file writer task panicked")?
        .context("failed to write to git cat-file stdin")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git cat-file --batch-check failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    let missing = parse_missing(&String::from_utf8_lossy(&output.stdout));
    debug!(missing = missing.len(), "git cat-file complete");
    Ok(missing)
}

/// Pick `<oid> missing` lines out of `cat-file --batch-check` output.
fn parse_missing(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_suffix(" missing"))
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------------------
// Upload-pack (streamed)
// ---------------------------------------------------------------------------

/// Spawn `git upload-pack --stateless-rpc [--advertise-refs] <repo_path>` and
/// return its stdout as a stream.
///
/// `input`, when present, is written to stdin from a separate task.  The first
/// chunk of output is read before returning so that a process that dies
/// without producing anything is reported as an error rather than an empty
/// response.  The child is reaped in the background once the stream ends.
#[instrument(skip(git, input), fields(repo = %repo_path.display(), advertise = input.is_none()))]
pub async fn git_upload_pack_streamed(
    git: &GitBinary,
    repo_path: &Path,
    git_protocol: Option<&str>,
    input: Option<Bytes>,
) -> Result<ProtocolStream> {
    let mut cmd = git.command();
    cmd.arg("upload-pack").arg("--stateless-rpc");
    if input.is_none() {
        cmd.arg("--advertise-refs");
    }
    cmd.arg(repo_path);
    if let Some(protocol) = git_protocol {
        cmd.env("GIT_PROTOCOL", protocol);
    }

    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .context("failed to spawn git upload-pack (streamed)")?;

    if let (Some(body), Some(mut stdin)) = (input, child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&body).await {
                // upload-pack may legitimately stop reading early.
                debug!(error = %e, "git upload-pack closed stdin early");
            }
        });
    }

    let stderr_task = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        })
    });

    let mut stdout = child
        .stdout
        .take()
        .context("git upload-pack stdout missing")?;

    let mut first = vec![0u8; 8192];
    let n = stdout
        .read(&mut first)
        .await
        .context("failed to read git upload-pack output")?;
    first.truncate(n);

    if n == 0 {
        let status = child
            .wait()
            .await
            .context("failed to wait for git upload-pack")?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            bail!(
                "git upload-pack failed (status {}): {}",
                status,
                stderr.trim(),
            );
        }
        return Ok(Box::new(std::io::Cursor::new(Vec::new())));
    }

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => debug!("git upload-pack finished"),
            Ok(status) => {
                let stderr = match stderr_task {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                warn!(
                    %status,
                    stderr = %stderr.trim(),
                    "git upload-pack exited with non-zero status"
                );
            }
            Err(e) => warn!(error = %e, "failed to reap git upload-pack"),
        }
    });

    Ok(Box::new(std::io::Cursor::new(first).chain(stdout)))
}

// ---------------------------------------------------------------------------
// Version
// ---------------------------------------------------------------------------

/// Run `git --version`, returning e.g. `git version 2.43.0`.
pub async fn git_version(git: &GitBinary) -> Result<String> {
    let output = git
        .command()
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {}", git.program()))?;

    if !output.status.success() {
        bail!("git --version failed (status {})", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
