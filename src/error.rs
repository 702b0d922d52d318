//! Error taxonomy for the mirror core.
//!
//! [`ProxyError`] is what the orchestrator returns; the HTTP layer maps each
//! variant onto a status code via [`ProxyError::status_code`].

use std::time::Duration;

use axum::http::StatusCode;

/// Failure to bring a mirror up to date with its upstream.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("clone of {url} failed: {source:#}")]
    Clone {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("refresh of {url} failed: {source:#}")]
    Refresh {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{operation} of {url} timed out after {after:?}")]
    TimedOut {
        operation: &'static str,
        url: String,
        after: Duration,
        mirror_present: bool,
    },

    #[error("mirror filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether a previously valid mirror is still on disk after this failure.
    pub fn mirror_present(&self) -> bool {
        match self {
            Self::Refresh { .. } => true,
            Self::TimedOut { mirror_present, .. } => *mirror_present,
            Self::Clone { .. } | Self::Io(_) => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Whether an initial clone failed because upstream has no such
    /// repository, judged from git's error text.
    pub fn upstream_missing(&self) -> bool {
        let Self::Clone { source, .. } = self else {
            return false;
        };
        let text = format!("{source:#}").to_ascii_lowercase();
        text.contains("repository not found")
            || (text.contains("repository '") && text.contains("' not found"))
            || text.contains("does not appear to be a git repository")
    }
}

/// Every way a proxied request can fail before or while serving.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("no namespace matches {0:?}")]
    NotFound(String),

    #[error("invalid repository path: {0}")]
    InvalidPath(String),

    #[error("bad protocol request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("timed out after {after:?} waiting for mirror {key}")]
    Timeout { key: String, after: Duration },

    #[error("protocol serve failed: {0:#}")]
    ProtocolServe(anyhow::Error),
}

impl ProxyError {
    /// Short machine-readable code, also used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidPath(_) => "invalid_path",
            Self::BadRequest(_) => "bad_request",
            Self::Fetch(e) if e.is_timeout() => "fetch_timeout",
            Self::Fetch(e) if e.upstream_missing() => "upstream_not_found",
            Self::Fetch(_) => "fetch_error",
            Self::Timeout { .. } => "lock_timeout",
            Self::ProtocolServe(_) => "protocol_serve_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidPath(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Fetch(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Fetch(e) if e.upstream_missing() => StatusCode::NOT_FOUND,
            Self::Fetch(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::ProtocolServe(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
