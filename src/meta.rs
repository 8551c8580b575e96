//! Request metadata and response envelope types.
//!
//! A `RequestMeta` travels with every request through the pipeline and is
//! attached (redacted) to errors and diagnostic events. A `Response` is what
//! callers get back on success: the decoded body plus status, headers,
//! parsed warnings, and the final meta.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::connection::{BodyStream, NodeStatus};

/// Header map with lowercase keys. Multi-value headers are pre-joined with
/// `", "` at the wire boundary.
pub type HeaderMap = HashMap<String, String>;

/// Lowercase every key of a header map, later duplicates winning.
pub fn normalize_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Sniff metadata
// ---------------------------------------------------------------------------

/// Why a topology refresh was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SniffReason {
    SniffOnStart,
    SniffInterval,
    SniffOnConnectionFault,
    /// Explicitly requested through `Transport::sniff`.
    Requested,
}

impl SniffReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SniffReason::SniffOnStart => "sniff-on-start",
            SniffReason::SniffInterval => "sniff-interval",
            SniffReason::SniffOnConnectionFault => "sniff-on-connection-fault",
            SniffReason::Requested => "requested",
        }
    }
}

/// Attached to meta when the request triggered a topology refresh.
#[derive(Debug, Clone, Serialize)]
pub struct SniffMeta {
    pub hosts: Vec<String>,
    pub reason: SniffReason,
}

// ---------------------------------------------------------------------------
// Connection snapshot
// ---------------------------------------------------------------------------

/// Credential-free snapshot of the connection a request was dispatched to.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub url: String,
    pub status: NodeStatus,
}

// ---------------------------------------------------------------------------
// Request meta
// ---------------------------------------------------------------------------

/// The request parameters as recorded in meta (what is safe to log).
#[derive(Debug, Clone, Serialize)]
pub struct MetaRequest {
    pub method: String,
    pub path: String,
    pub querystring: String,
    pub headers: HeaderMap,
    /// Loggable snapshot of the per-request options.
    pub options: Value,
}

/// Per-request bookkeeping carried through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMeta {
    pub request_id: String,
    /// Human name of the owning client, for diagnostics.
    pub name: String,
    pub context: Option<Value>,
    /// Number of retries performed (0 on the first attempt).
    pub attempts: u32,
    pub aborted: bool,
    pub connection: Option<ConnectionInfo>,
    pub request: MetaRequest,
    pub sniff: Option<SniffMeta>,
}

// ---------------------------------------------------------------------------
// Response envelope
// ---------------------------------------------------------------------------

/// Decoded response body.
pub enum ResponseBody {
    /// Parsed JSON document.
    Json(Value),
    /// Plain text (non-JSON content type, or no content type).
    Text(String),
    /// Binary content type, or payload kept raw.
    Binary(Bytes),
    /// HEAD requests resolve to a boolean.
    Bool(bool),
    /// Raw stream, when the caller asked for one.
    Stream(BodyStream),
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Json(v) => f.debug_tuple("Json").field(v).finish(),
            ResponseBody::Text(t) => f.debug_tuple("Text").field(t).finish(),
            ResponseBody::Binary(b) => f.debug_tuple("Binary").field(&b.len()).finish(),
            ResponseBody::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl ResponseBody {
    /// The parsed JSON document, when the body is one.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ResponseBody::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ResponseBody::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// What a successful request resolves to.
#[derive(Debug)]
pub struct Response {
    pub body: ResponseBody,
    pub status_code: u16,
    pub headers: HeaderMap,
    /// Server warnings, filtered to Elasticsearch-sourced entries.
    pub warnings: Vec<String>,
    pub meta: RequestMeta,
}

// ---------------------------------------------------------------------------
// Warning header parsing
// ---------------------------------------------------------------------------

/// Parse the `Warning` header value(s) into Elasticsearch warning entries.
///
/// Entries are split on commas that are not inside double quotes, then
/// filtered to `NNN Elasticsearch-` prefixed warnings.
pub fn parse_warnings(headers: &HeaderMap) -> Vec<String> {
    let Some(raw) = headers.get("warning") else {
        return Vec::new();
    };
    split_outside_quotes(raw)
        .into_iter()
        .map(|s| s.trim().to_owned())
        .filter(|s| is_es_warning(s))
        .collect()
}

fn split_outside_quotes(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

/// Matches `^\d{3} Elasticsearch-`.
fn is_es_warning(entry: &str) -> bool {
    let bytes = entry.as_bytes();
    bytes.len() > 4
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && bytes[3] == b' '
        && entry[4..].starts_with("Elasticsearch-")
}
