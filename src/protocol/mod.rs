//! Smart-HTTP request model.
//!
//! The proxy is a pass-through for protocol bytes; this module only carries
//! the request to `git upload-pack` and pulls out what the mirror needs to be
//! fresh for (see [`crate::mirror::refspec`]).

pub mod pktline;

use bytes::Bytes;

/// Value of the client's `Git-Protocol` header, forwarded as `GIT_PROTOCOL`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitProtocol(Option<String>);

impl GitProtocol {
    pub fn from_header(value: Option<&str>) -> Self {
        Self(
            value
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        )
    }

    pub fn as_env(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Whether the client asked for protocol v2 (`version=2` among the
    /// colon-separated parameters).
    pub fn is_v2(&self) -> bool {
        self.0
            .as_deref()
            .is_some_and(|v| v.split(':').any(|p| p.trim() == "version=2"))
    }
}

/// One inbound smart-protocol interaction.
#[derive(Debug, Clone)]
pub enum ProtocolRequest {
    /// `GET .../info/refs?service=git-upload-pack`
    Advertise { protocol: GitProtocol },
    /// `POST .../git-upload-pack`, body already inflated.
    UploadPack { protocol: GitProtocol, body: Bytes },
}

impl ProtocolRequest {
    pub fn protocol(&self) -> &GitProtocol {
        match self {
            Self::Advertise { protocol } | Self::UploadPack { protocol, .. } => protocol,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Advertise { .. } => "advertise",
            Self::UploadPack { .. } => "upload-pack",
        }
    }
}
