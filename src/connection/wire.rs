//! The pluggable HTTP engine seam.
//!
//! A `Wire` is a narrow contract: ship one already-composed request to one
//! URL and hand back status, headers, and a byte stream. Everything above it
//! (header merging, size caps, text decoding, retries, health) belongs to the
//! connection and transport layers; everything below it (sockets, TLS,
//! keep-alive pools) belongs to the engine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::errors::Error;
use crate::meta::HeaderMap;

/// A response (or request) body as a stream of chunks.
pub type BodyStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Request body handed to the engine.
pub enum WireBody {
    Bytes(Bytes),
    Stream(BodyStream),
}

impl std::fmt::Debug for WireBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireBody::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            WireBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A fully composed request: the engine does no header or URL rewriting.
#[derive(Debug)]
pub struct WireRequest {
    /// Upper-case HTTP verb.
    pub method: String,
    pub url: Url,
    /// Lowercase header names, values as they should hit the wire.
    pub headers: HeaderMap,
    pub body: Option<WireBody>,
}

/// Per-call engine options.
#[derive(Debug, Clone, Default)]
pub struct WireOptions {
    /// Cancelling this token must abort the in-flight exchange and release
    /// the socket. The connection layer owns deadline and caller signals and
    /// folds both into this one token.
    pub signal: CancellationToken,
}

/// Raw engine response; the body has not been read yet.
pub struct WireResponse {
    pub status: u16,
    /// Lowercase header names; repeated headers joined with `", "`.
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for WireResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Engine-level failure (socket, DNS, TLS, protocol).
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct WireError {
    pub message: String,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        WireError {
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Wire: Send + Sync + std::fmt::Debug {
    async fn request(
        &self,
        request: WireRequest,
        options: WireOptions,
    ) -> Result<WireResponse, WireError>;

    /// Release kept-alive sockets. Best-effort; engines swallow failures.
    async fn close(&self) {}
}

/// Builds one engine per node URL, so each connection owns its own socket
/// pool and `close` releases exactly that node's resources.
pub type WireBuilder = Arc<dyn Fn(&Url) -> Result<Arc<dyn Wire>, Error> + Send + Sync>;

/// Engine configuration channels (consumed by the stock reqwest engine).
#[derive(Debug, Clone, Default)]
pub struct WireConfig {
    /// How long an idle kept-alive socket survives.
    pub keep_alive_idle: Option<Duration>,
    /// Upper bound on idle sockets per node.
    pub max_idle_per_host: Option<usize>,
    /// HTTP or HTTPS proxy URL.
    pub proxy: Option<String>,
    /// Pin the fleet's CA by SHA-256 fingerprint (hex, colons optional).
    /// When set, ordinary chain validation is replaced by the pin check.
    pub ca_fingerprint: Option<String>,
    /// Skip server certificate validation entirely. Test clusters only.
    pub accept_invalid_certs: bool,
}
