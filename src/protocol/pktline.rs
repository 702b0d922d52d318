//! Git packet-line framing.
//!
//! Each packet line is prefixed with a 4-character hex length that includes
//! itself:
//!
//! - `0000` -- flush packet (end of section)
//! - `0001` -- delimiter packet
//! - `0002` -- response-end packet
//! - `0004`+ -- data packet (length includes the 4 prefix bytes)
//!
//! The proxy only decodes client requests far enough to learn which refs and
//! objects they need; the bytes themselves are handed to `git upload-pack`
//! untouched.

use tracing::trace;

/// A single Git packet line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data packet containing arbitrary bytes.
    Data(Vec<u8>),
    /// Flush packet (`0000`).
    Flush,
    /// Delimiter packet (`0001`).
    Delimiter,
    /// Response-end packet (`0002`).
    ResponseEnd,
}

impl PktLine {
    /// Payload of a data packet with any trailing newline removed.
    pub fn text(&self) -> Option<&[u8]> {
        match self {
            PktLine::Data(d) => Some(d.strip_suffix(b"\n").unwrap_or(d.as_slice())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PktLineError {
    #[error("invalid packet-line length prefix at offset {offset}")]
    InvalidLength { offset: usize },
    #[error("truncated packet-line at offset {offset}: declared {declared}, {available} available")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a byte slice as a packet-line (4-hex-digit length prefix + data).
///
/// Callers must keep `data` below 65516 bytes, the protocol maximum.
pub fn encode_pkt_line(data: &[u8]) -> Vec<u8> {
    let total_len = data.len() + 4;
    debug_assert!(total_len <= 0xFFFF, "packet-line data too large");
    let mut buf = Vec::with_capacity(total_len);
    buf.extend_from_slice(format!("{total_len:04x}").as_bytes());
    buf.extend_from_slice(data);
    buf
}

pub const FLUSH_PKT: &[u8] = b"0000";

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a complete sequence of packet lines.
///
/// Unlike a streaming reader this insists that `data` holds whole packets
/// only; leftover bytes are an error because the request body is complete.
pub fn decode_pkt_lines(data: &[u8]) -> Result<Vec<PktLine>, PktLineError> {
    let mut packets = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        if pos + 4 > data.len() {
            return Err(PktLineError::Truncated {
                offset: pos,
                declared: 4,
                available: data.len() - pos,
            });
        }

        let pkt_len = std::str::from_utf8(&data[pos..pos + 4])
            .ok()
            .and_then(|s| usize::from_str_radix(s, 16).ok())
            .ok_or(PktLineError::InvalidLength { offset: pos })?;

        match pkt_len {
            0 => packets.push(PktLine::Flush),
            1 => packets.push(PktLine::Delimiter),
            2 => packets.push(PktLine::ResponseEnd),
            3 => return Err(PktLineError::InvalidLength { offset: pos }),
            n => {
                if pos + n > data.len() {
                    return Err(PktLineError::Truncated {
                        offset: pos,
                        declared: n,
                        available: data.len() - pos,
                    });
                }
                trace!(offset = pos, payload_len = n - 4, "data packet");
                packets.push(PktLine::Data(data[pos + 4..pos + n].to_vec()));
                pos += n;
                continue;
            }
        }
        pos += 4;
    }

    Ok(packets)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
