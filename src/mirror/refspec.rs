//! Which refs a request needs fresh before it can be served.
//!
//! Policy:
//! - a v0/v1 ref advertisement (`info/refs`), or `ls-refs` without `refs/`
//!   prefixes, refreshes every ref;
//! - a v2 `info/refs` only lists capabilities, so it needs the mirror to
//!   exist and nothing more;
//! - `ls-refs` with `ref-prefix` arguments refreshes only those prefixes;
//! - a v2 `fetch` naming refs via `want-ref` refreshes exactly those refs;
//! - a negotiation that only names object ids (`want <oid>`) needs nothing
//!   from upstream when the objects are already mirrored, and otherwise
//!   refreshes every ref.

use std::collections::BTreeSet;
use std::fmt;

use crate::error::ProxyError;
use crate::protocol::pktline::{decode_pkt_lines, PktLine};
use crate::protocol::ProtocolRequest;

/// Full-mirror refspec, also used by `git clone --mirror`.
pub const ALL_REFS: &str = "+refs/*:refs/*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSpec {
    /// Every ref upstream has.
    All,
    /// Refs under these prefixes (`ref-prefix` values, e.g. `refs/heads/`).
    Prefixes(Vec<String>),
    /// Exactly these fully-qualified refs.
    Refs(Vec<String>),
    /// These objects must be present; an empty list means "whatever the
    /// mirror already has".
    Objects(Vec<String>),
}

impl RefSpec {
    /// Derive the refspec implied by an inbound request.
    pub fn from_request(request: &ProtocolRequest) -> Result<Self, ProxyError> {
        match request {
            ProtocolRequest::Advertise { protocol } if protocol.is_v2() => {
                Ok(Self::Objects(Vec::new()))
            }
            ProtocolRequest::Advertise { .. } => Ok(Self::All),
            ProtocolRequest::UploadPack { body, .. } => Self::from_upload_pack_body(body),
        }
    }

    fn from_upload_pack_body(body: &[u8]) -> Result<Self, ProxyError> {
        let packets = decode_pkt_lines(body)
            .map_err(|e| ProxyError::BadRequest(format!("malformed upload-pack request: {e}")))?;
        let lines: Vec<&[u8]> = packets.iter().filter_map(PktLine::text).collect();

        let command = lines
            .first()
            .and_then(|first| first.strip_prefix(b"command="));

        match command {
            Some(b"ls-refs") => {
                let mut prefixes = BTreeSet::new();
                for arg in arguments(&lines, b"ref-prefix ") {
                    let prefix = utf8(arg)?;
                    if !prefix.starts_with("refs/") {
                        // `HEAD`, bare short names: only a full refresh can
                        // answer those.
                        continue;
                    }
                    check_ref_name(prefix, true)?;
                    prefixes.insert(prefix.to_string());
                }
                if prefixes.is_empty() {
                    Ok(Self::All)
                } else {
                    Ok(Self::Prefixes(prefixes.into_iter().collect()))
                }
            }
            Some(b"fetch") => {
                let mut refs = BTreeSet::new();
                for arg in arguments(&lines, b"want-ref ") {
                    let name = utf8(arg)?;
                    check_ref_name(name, false)?;
                    refs.insert(name.to_string());
                }
                if !refs.is_empty() {
                    return Ok(Self::Refs(refs.into_iter().collect()));
                }
                Ok(Self::Objects(wanted_objects(&lines)?))
            }
            Some(_) => Ok(Self::Objects(Vec::new())),
            None => Ok(Self::Objects(wanted_objects(&lines)?)),
        }
    }

    /// Refspecs handed to `git fetch` to satisfy this request.
    pub fn fetch_refspecs(&self) -> Vec<String> {
        match self {
            Self::All | Self::Objects(_) => vec![ALL_REFS.to_string()],
            Self::Prefixes(prefixes) => prefixes.iter().map(|p| format!("+{p}*:{p}*")).collect(),
            Self::Refs(refs) => refs.iter().map(|r| format!("+{r}:{r}")).collect(),
        }
    }

    /// Whether satisfying this spec mirrors the whole upstream ref set.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::All | Self::Objects(_))
    }
}

impl fmt::Display for RefSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Prefixes(p) => write!(f, "prefixes[{}]", p.join(",")),
            Self::Refs(r) => write!(f, "refs[{}]", r.join(",")),
            Self::Objects(o) => write!(f, "objects[{}]", o.len()),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn arguments<'a>(lines: &'a [&'a [u8]], keyword: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
    lines
        .iter()
        .filter_map(move |line| line.strip_prefix(keyword))
        .map(|arg| arg.trim_ascii())
}

/// Object ids from `want <oid> [capabilities]` lines.
fn wanted_objects(lines: &[&[u8]]) -> Result<Vec<String>, ProxyError> {
    let mut oids = BTreeSet::new();
    for arg in arguments(lines, b"want ") {
        let oid = utf8(arg)?.split(' ').next().unwrap_or_default();
        if !is_object_id(oid) {
            return Err(ProxyError::BadRequest(format!("invalid object id {oid:?}")));
        }
        oids.insert(oid.to_ascii_lowercase());
    }
    Ok(oids.into_iter().collect())
}

fn utf8(bytes: &[u8]) -> Result<&str, ProxyError> {
    std::str::from_utf8(bytes)
        .map_err(|_| ProxyError::BadRequest("non-UTF-8 argument in request".to_string()))
}

fn is_object_id(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Subset of `git check-ref-format` rules, strict enough that a client value
/// can never be read as an option or a second refspec by `git fetch`.
fn check_ref_name(name: &str, is_prefix: bool) -> Result<(), ProxyError> {
    let bad = |why: &str| Err(ProxyError::BadRequest(format!("invalid ref {name:?}: {why}")));

    if !name.starts_with("refs/") {
        return bad("must start with refs/");
    }
    if name
        .chars()
        .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return bad("forbidden character");
    }
    if name.contains("..") || name.contains("@{") || name.contains("//") {
        return bad("forbidden sequence");
    }

    let body = if is_prefix {
        name.strip_suffix('/').unwrap_or(name)
    } else {
        name
    };
    if body.ends_with('/') || body.ends_with('.') {
        return bad("bad ending");
    }
    for component in body.split('/') {
        if component.is_empty() || component.starts_with('.') || component.ends_with(".lock") {
            return bad("bad path component");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::pktline::{encode_pkt_line, FLUSH_PKT};
    use crate::protocol::GitProtocol;

    const OID_A: &str = "1111111111111111111111111111111111111111";
    const OID_B: &str = "2222222222222222222222222222222222222222";

    fn upload_pack(lines: &[&str], delim_after: usize) -> ProtocolRequest {
        let mut wire = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            if i == delim_after {
                wire.extend_from_slice(b"0001");
            }
            wire.extend_from_slice(&encode_pkt_line(format!("{line}\n").as_bytes()));
        }
        wire.extend_from_slice(FLUSH_PKT);
        ProtocolRequest::UploadPack {
            protocol: GitProtocol::from_header(Some("version=2")),
            body: Bytes::from(wire),
        }
    }

    #[test]
    fn advertisement_refreshes_everything() {
        let req = ProtocolRequest::Advertise {
            protocol: GitProtocol::default(),
        };
        assert_eq!(RefSpec::from_request(&req).unwrap(), RefSpec::All);
        assert_eq!(RefSpec::All.fetch_refspecs(), vec![ALL_REFS.to_string()]);
    }

    #[test]
    fn v2_capability_advertisement_needs_no_refresh() {
        let req = ProtocolRequest::Advertise {
            protocol: GitProtocol::from_header(Some("version=2")),
        };
        let spec = RefSpec::from_request(&req).unwrap();
        assert_eq!(spec, RefSpec::Objects(Vec::new()));
        assert!(spec.is_full());
    }

    #[test]
    fn ls_refs_with_prefixes_is_narrow() {
        let req = upload_pack(
            &[
                "command=ls-refs",
                "agent=git/2.43.0",
                "peel",
                "symrefs",
                "ref-prefix HEAD",
                "ref-prefix refs/heads/main",
                "ref-prefix main",
            ],
            2,
        );
        let spec = RefSpec::from_request(&req).unwrap();
        assert_eq!(spec, RefSpec::Prefixes(vec!["refs/heads/main".to_string()]));
        assert_eq!(
            spec.fetch_refspecs(),
            vec!["+refs/heads/main*:refs/heads/main*".to_string()]
        );
    }

    #[test]
    fn ls_refs_without_prefixes_is_full() {
        let req = upload_pack(&["command=ls-refs", "agent=git/2.43.0", "symrefs"], 2);
        assert_eq!(RefSpec::from_request(&req).unwrap(), RefSpec::All);

        let head_only = upload_pack(&["command=ls-refs", "ref-prefix HEAD"], 1);
        assert_eq!(RefSpec::from_request(&head_only).unwrap(), RefSpec::All);
    }

    #[test]
    fn fetch_with_want_ref_is_narrow() {
        let req = upload_pack(
            &[
                "command=fetch",
                "agent=git/2.43.0",
                "want-ref refs/heads/main",
                &format!("want {OID_A}"),
                "done",
            ],
            2,
        );
        let spec = RefSpec::from_request(&req).unwrap();
        assert_eq!(spec, RefSpec::Refs(vec!["refs/heads/main".to_string()]));
        assert_eq!(
            spec.fetch_refspecs(),
            vec!["+refs/heads/main:refs/heads/main".to_string()]
        );
    }

    #[test]
    fn fetch_with_object_wants() {
        let req = upload_pack(
            &[
                "command=fetch",
                "agent=git/2.43.0",
                &format!("want {OID_B}"),
                &format!("want {OID_A}"),
                "done",
            ],
            2,
        );
        assert_eq!(
            RefSpec::from_request(&req).unwrap(),
            RefSpec::Objects(vec![OID_A.to_string(), OID_B.to_string()])
        );
    }

    #[test]
    fn v0_negotiation_wants_objects() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_pkt_line(
            format!("want {OID_A} multi_ack_detailed side-band-64k ofs-delta\n").as_bytes(),
        ));
        wire.extend_from_slice(&encode_pkt_line(format!("want {OID_B}\n").as_bytes()));
        wire.extend_from_slice(FLUSH_PKT);
        wire.extend_from_slice(&encode_pkt_line(b"done\n"));
        let req = ProtocolRequest::UploadPack {
            protocol: GitProtocol::default(),
            body: Bytes::from(wire),
        };
        assert_eq!(
            RefSpec::from_request(&req).unwrap(),
            RefSpec::Objects(vec![OID_A.to_string(), OID_B.to_string()])
        );
    }

    #[test]
    fn other_commands_need_nothing_new() {
        let req = upload_pack(&["command=object-info", "size"], 1);
        assert_eq!(
            RefSpec::from_request(&req).unwrap(),
            RefSpec::Objects(Vec::new())
        );
    }

    #[test]
    fn rejects_option_like_and_multi_refspec_refs() {
        for bad in [
            "want-ref --upload-pack=touch",
            "want-ref refs/heads/a:refs/heads/b",
            "want-ref refs/heads/../../x",
            "want-ref refs/heads/*",
            "want-ref refs/heads/x.lock",
        ] {
            let req = upload_pack(&["command=fetch", bad], 1);
            assert!(
                matches!(RefSpec::from_request(&req), Err(ProxyError::BadRequest(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_bad_object_ids_and_framing() {
        let req = upload_pack(&["command=fetch", "want not-an-oid"], 1);
        assert!(matches!(
            RefSpec::from_request(&req),
            Err(ProxyError::BadRequest(_))
        ));

        let truncated = ProtocolRequest::UploadPack {
            protocol: GitProtocol::default(),
            body: Bytes::from_static(b"00ffwant"),
        };
        assert!(matches!(
            RefSpec::from_request(&truncated),
            Err(ProxyError::BadRequest(_))
        ));
    }

    #[test]
    fn prefix_rules() {
        assert!(check_ref_name("refs/heads/", true).is_ok());
        assert!(check_ref_name("refs/tags/v1", true).is_ok());
        assert!(check_ref_name("refs/heads/", false).is_err());
        assert!(check_ref_name("refs/heads/.hidden", false).is_err());
    }
}
