//! Transport error taxonomy.
//!
//! Exactly one typed error surfaces per failed request; wire-layer errors are
//! classified into this enum before callers see them. Variants that carry
//! request meta only ever hold meta that has already been through the
//! configured redaction policy.

use serde_json::Value;

use crate::meta::{RequestMeta, Response};
use crate::redact::Redaction;

pub use shoal_codec::{DeserializationError, SerializationError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The per-request deadline fired before the node answered.
    #[error("request timed out: {message}")]
    Timeout {
        message: String,
        meta: Option<Box<RequestMeta>>,
    },

    /// Socket / DNS / engine-level failure talking to a node.
    #[error("connection failure: {message}")]
    Connection {
        message: String,
        meta: Option<Box<RequestMeta>>,
    },

    /// The pool could not offer any connection for this request.
    #[error("no living connections: the node pool returned no connection")]
    NoLivingConnections { meta: Option<Box<RequestMeta>> },

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    /// Invalid construction-time or per-request configuration.
    #[error("configuration: {0}")]
    Configuration(String),

    /// The node answered with a non-ignored error status.
    #[error("{}", response_error_message(.0))]
    Response(Box<Response>),

    /// The caller cancelled the request.
    #[error("request aborted: {message}")]
    RequestAborted {
        message: String,
        meta: Option<Box<RequestMeta>>,
    },

    /// A 2xx response did not identify as the expected product.
    #[error("{message}")]
    ProductNotSupported {
        message: String,
        meta: Option<Box<RequestMeta>>,
    },
}

impl Error {
    /// The redacted request meta, when this error carries one.
    pub fn meta(&self) -> Option<&RequestMeta> {
        match self {
            Error::Timeout { meta, .. }
            | Error::Connection { meta, .. }
            | Error::NoLivingConnections { meta }
            | Error::RequestAborted { meta, .. }
            | Error::ProductNotSupported { meta, .. } => meta.as_deref(),
            Error::Response(response) => Some(&response.meta),
            _ => None,
        }
    }

    /// The full response envelope, when the node answered with an error body.
    pub fn response(&self) -> Option<&Response> {
        match self {
            Error::Response(response) => Some(response),
            _ => None,
        }
    }

    /// The response status code, when one was received.
    pub fn status_code(&self) -> Option<u16> {
        self.response().map(|r| r.status_code)
    }

    /// Attach (redacted) meta to a meta-less error bubbling out of the
    /// connection layer, rebuilding the variant so the surfaced error owns a
    /// clean trace.
    pub(crate) fn with_meta(self, mut meta: RequestMeta, redaction: &Redaction) -> Self {
        redaction.apply(&mut meta);
        let meta = Some(Box::new(meta));
        match self {
            Error::Timeout { message, .. } => Error::Timeout { message, meta },
            Error::Connection { message, .. } => Error::Connection { message, meta },
            Error::NoLivingConnections { .. } => Error::NoLivingConnections { meta },
            Error::RequestAborted { message, .. } => Error::RequestAborted { message, meta },
            Error::ProductNotSupported { message, .. } => {
                Error::ProductNotSupported { message, meta }
            }
            other => other,
        }
    }

    /// Whether the attempt loop may retry after this error.
    pub(crate) fn is_retryable(&self, retry_on_timeout: bool) -> bool {
        match self {
            Error::Connection { .. } => true,
            Error::Timeout { .. } => retry_on_timeout,
            _ => false,
        }
    }
}

/// Render a `ResponseError` message from the response body.
///
/// Structured error bodies format as the error type followed by its causal
/// chain; anything else falls back to the raw payload or the status code.
fn response_error_message(response: &Response) -> String {
    if let Some(body) = response.body.as_json() {
        if let Some(error) = body.get("error") {
            if let Some(formatted) = format_structured_error(error) {
                return formatted;
            }
            if let Some(text) = error.as_str() {
                return text.to_owned();
            }
        }
        return body.to_string();
    }
    if let Some(text) = response.body.as_text() {
        if !text.is_empty() {
            return text.to_owned();
        }
    }
    format!("response error: status {}", response.status_code)
}

fn format_structured_error(error: &Value) -> Option<String> {
    let error_type = error.get("type")?.as_str()?;
    let mut message = error_type.to_owned();

    if let Some(caused_by) = error.get("caused_by") {
        message.push_str("\n\tCaused by:\n\t\t");
        message.push_str(&type_and_reason(caused_by));
    }
    if let Some(root_causes) = error.get("root_cause").and_then(Value::as_array) {
        if !root_causes.is_empty() {
            message.push_str("\n\tRoot causes:\n\t\t");
            let rendered: Vec<String> = root_causes.iter().map(type_and_reason).collect();
            message.push_str(&rendered.join("\n\t\t"));
        }
    }
    Some(message)
}

fn type_and_reason(error: &Value) -> String {
    let error_type = error.get("type").and_then(Value::as_str).unwrap_or("unknown");
    let reason = error.get("reason").and_then(Value::as_str).unwrap_or("unknown");
    format!("{error_type}: {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{MetaRequest, ResponseBody};
    use serde_json::json;

    fn response_with_body(body: ResponseBody, status: u16) -> Response {
        Response {
            body,
            status_code: status,
            headers: crate::meta::HeaderMap::new(),
            warnings: Vec::new(),
            meta: RequestMeta {
                request_id: "1".to_owned(),
                name: "shoal".to_owned(),
                context: None,
                attempts: 0,
                aborted: false,
                connection: None,
                request: MetaRequest {
                    method: "GET".to_owned(),
                    path: "/".to_owned(),
                    querystring: String::new(),
                    headers: crate::meta::HeaderMap::new(),
                    options: Value::Null,
                },
                sniff: None,
            },
        }
    }

    #[test]
    fn structured_error_formats_causal_chain() {
        let body = json!({
            "error": {
                "type": "index_not_found_exception",
                "caused_by": {"type": "resource_missing", "reason": "no such index"},
                "root_cause": [
                    {"type": "index_not_found_exception", "reason": "missing [logs]"},
                    {"type": "shard_failure", "reason": "primary gone"},
                ],
            },
            "status": 404,
        });
        let err = Error::Response(Box::new(response_with_body(ResponseBody::Json(body), 404)));
        let message = err.to_string();
        assert!(message.starts_with("index_not_found_exception"));
        assert!(message.contains("\n\tCaused by:\n\t\tresource_missing: no such index"));
        assert!(message.contains("\n\tRoot causes:\n\t\tindex_not_found_exception: missing [logs]"));
        assert!(message.contains("\n\t\tshard_failure: primary gone"));
    }

    #[test]
    fn unstructured_json_body_renders_verbatim() {
        let err = Error::Response(Box::new(response_with_body(
            ResponseBody::Json(json!({"ok": false})),
            500,
        )));
        assert_eq!(err.to_string(), r#"{"ok":false}"#);
    }

    #[test]
    fn empty_body_falls_back_to_status() {
        let err = Error::Response(Box::new(response_with_body(
            ResponseBody::Text(String::new()),
            503,
        )));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn retryability_by_variant() {
        let conn = Error::Connection {
            message: "reset".to_owned(),
            meta: None,
        };
        let timeout = Error::Timeout {
            message: "deadline".to_owned(),
            meta: None,
        };
        assert!(conn.is_retryable(false));
        assert!(!timeout.is_retryable(false));
        assert!(timeout.is_retryable(true));
        assert!(!Error::Configuration("x".to_owned()).is_retryable(true));
    }
}
