//! Wire grammar of the hdc channel protocol.
//!
//! Every message on the bridge socket is a length-prefixed frame:
//!
//! ```text
//! [Header: 4 bytes BE u32 len] [Payload: len bytes]
//! ```
//!
//! A zero `len` is a valid frame with an empty payload. There is no type
//! tag on the wire; the meaning of a payload is positional, determined by
//! the command that was sent before it.
//!
//! Command payloads are plain text (`list targets`, `fport ls`,
//! `shell <cmd>`, ...). This module also holds the parsers for the three
//! textual reply shapes the server produces: target lists, port-mapping
//! lists, and `key = value` parameter dumps.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// ASCII prefix of the server banner sent right after accept.
pub const HANDSHAKE_PREFIX: &[u8] = b"OHOS HDC";

/// Width of the zero-padded connect-key field in the handshake reply.
pub const CONNECT_KEY_LEN: usize = 32;

/// A server-owned port mapping record.
///
/// `local` and `remote` are endpoint strings of the form `"<scheme>:<value>"`,
/// e.g. `"tcp:8000"`. The server is the source of truth for these; the client
/// never caches them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Connect key of the device the mapping belongs to.
    pub target: String,
    /// Host-side endpoint.
    pub local: String,
    /// Device-side endpoint.
    pub remote: String,
}

// ---------------------------------------------------------------------------
// Frame helpers
// ---------------------------------------------------------------------------

/// Wrap a payload with the 4-byte BE length header.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Read the payload length from a 4-byte BE header.
pub fn read_frame_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Build the handshake reply frame payload: the server banner echoed back,
/// followed by the connect key in a fixed 32-byte zero-padded field.
///
/// Keys longer than the field are truncated; the empty key (server-global
/// commands) leaves the field all zeros.
pub fn encode_handshake(banner: &[u8], connect_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(banner.len() + CONNECT_KEY_LEN);
    out.extend_from_slice(banner);
    let mut field = [0u8; CONNECT_KEY_LEN];
    let key = connect_key.as_bytes();
    let n = key.len().min(CONNECT_KEY_LEN);
    field[..n].copy_from_slice(&key[..n]);
    out.extend_from_slice(&field);
    out
}

// ---------------------------------------------------------------------------
// Reply parsers
// ---------------------------------------------------------------------------

/// Parse the reply to `list targets`.
///
/// A reply containing `"Empty"` anywhere means no devices. Otherwise each
/// trimmed non-empty line is a connect key, in server order.
pub fn parse_targets(reply: &str) -> Vec<String> {
    if reply.contains("Empty") {
        return Vec::new();
    }
    reply
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse the reply to `fport ls`.
///
/// The same listing carries both directions; `reverse` selects which records
/// to keep. Lines must contain the literal `"Forward"` (or `"Reverse"`) and
/// at least three whitespace-separated fields; anything else is skipped.
/// Reverse records swap the local/remote field positions.
pub fn parse_ports(reply: &str, reverse: bool) -> Vec<Forward> {
    if reply.contains("Empty") {
        return Vec::new();
    }
    let marker = if reverse { "Reverse" } else { "Forward" };
    let mut out = Vec::new();
    for line in reply.lines() {
        let line = line.trim();
        if line.is_empty() || !line.contains(marker) {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let (local, remote) = if reverse {
            (fields[2], fields[1])
        } else {
            (fields[1], fields[2])
        };
        out.push(Forward {
            target: fields[0].to_owned(),
            local: local.to_owned(),
            remote: remote.to_owned(),
        });
    }
    out
}

static PARAM_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(.*?) = (.*?)\r?$").unwrap());

/// Parse the output of `shell param get` into a key/value map.
///
/// Lines that do not match the `key = value` grammar are ignored.
pub fn parse_parameters(reply: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in reply.lines() {
        if let Some(caps) = PARAM_LINE.captures(line) {
            out.insert(caps[1].to_owned(), caps[2].to_owned());
        }
    }
    out
}
