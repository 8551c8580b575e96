//! The per-request state machine.
//!
//! `Transport::request` composes headers, encodes and optionally compresses
//! the body, then loops: pick a connection, ship the exchange, classify the
//! outcome. Server hiccups (502/503/504) and connection faults mark the node
//! dead and retry; everything else resolves or surfaces exactly one typed
//! error with redacted meta.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

mod backoff;
mod sniff;

pub use backoff::{equal_jitter_backoff, BackoffFn};
pub use sniff::SniffAction;

use sniff::SniffState;

use crate::connection::{
    is_binary_content_type, is_compressed, BodyStream, ConnectionBody, ConnectionRequest,
    ConnectionRequestOptions, WireBody,
};
use crate::diagnostics::{Diagnostics, EventKind, EventPayload};
use crate::errors::Error;
use crate::meta::{
    normalize_headers, parse_warnings, HeaderMap, MetaRequest, RequestMeta, Response, ResponseBody,
    SniffReason,
};
use crate::pool::{ConnectionPool, SelectionOptions};
use crate::redact::Redaction;
use shoal_codec::{qserialize, BulkLine, DeserializationError, Query, Serializer};

// ---------------------------------------------------------------------------
// Defaults and host bounds
// ---------------------------------------------------------------------------

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SNIFF_ENDPOINT: &str = "/_nodes/_all/http";
const DEFAULT_JSON_CONTENT_TYPE: &str = "application/json";
const DEFAULT_NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
const DEFAULT_ACCEPT: &str = "application/json, text/plain";

/// Upper bound (and default) for text response bytes.
pub const MAX_TEXT_RESPONSE_BYTES: usize = 512 * 1024 * 1024;
/// Upper bound (and default) for raw (binary or compressed) response bytes.
pub const MAX_RAW_RESPONSE_BYTES: usize = 1024 * 1024 * 1024;

const BACKOFF_MIN_SECONDS: u32 = 0;
const BACKOFF_MAX_SECONDS: u32 = 30;

const USER_AGENT: &str = concat!("shoal/", env!("CARGO_PKG_VERSION"));
const CLIENT_META: &str = concat!("sh=", env!("CARGO_PKG_VERSION"), ",t=", env!("CARGO_PKG_VERSION"));

/// Response header carrying product identification.
const PRODUCT_HEADER: &str = "x-elastic-product";

// ---------------------------------------------------------------------------
// Request inputs
// ---------------------------------------------------------------------------

/// A request body, tagged by how the pipeline must treat it.
pub enum Body {
    /// Serialized with the JSON codec; content type defaults to JSON.
    Json(Value),
    /// Bulk lines, ND-serialized; content type defaults to NDJSON.
    NdJson(Vec<BulkLine>),
    /// Sent as-is; non-empty text defaults the content type to `text/plain`.
    Text(String),
    /// Pre-encoded payload, passed through untouched.
    Bytes(Bytes),
    /// Streamed payload. Streams cannot be replayed, so retries are disabled.
    Stream(BodyStream),
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Body::NdJson(lines) => f.debug_tuple("NdJson").field(&lines.len()).finish(),
            Body::Text(t) => f.debug_tuple("Text").field(&t.len()).finish(),
            Body::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct RequestParams {
    /// Upper-case HTTP verb.
    pub method: String,
    pub path: String,
    pub body: Option<Body>,
    pub querystring: Option<Query>,
}

impl RequestParams {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        RequestParams {
            method: method.into(),
            path: path.into(),
            body: None,
            querystring: None,
        }
    }

    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_querystring(mut self, query: impl Into<Query>) -> Self {
        self.querystring = Some(query.into());
        self
    }
}

/// Per-request overrides of the transport defaults.
#[derive(Default, Clone)]
pub struct RequestOptions {
    pub headers: Option<HeaderMap>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_on_timeout: Option<bool>,
    pub compression: Option<bool>,
    /// Status codes treated as success.
    pub ignore: Vec<u16>,
    pub as_stream: bool,
    pub opaque_id: Option<String>,
    pub signal: Option<CancellationToken>,
    pub max_response_size: Option<usize>,
    pub max_compressed_response_size: Option<usize>,
    pub redaction: Option<Redaction>,
    pub retry_backoff: Option<Arc<BackoffFn>>,
    pub context: Option<Value>,
    pub request_id: Option<String>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("ignore", &self.ignore)
            .field("as_stream", &self.as_stream)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct TransportBuilder {
    pool: Arc<dyn ConnectionPool>,
    name: String,
    headers: HeaderMap,
    max_retries: u32,
    request_timeout: Option<Duration>,
    retry_on_timeout: bool,
    compression: bool,
    sniff_interval: Option<Duration>,
    sniff_on_connection_fault: bool,
    sniff_on_start: bool,
    sniff_endpoint: String,
    node_filter: Option<crate::pool::NodeFilter>,
    node_selector: Option<crate::pool::NodeSelector>,
    opaque_id_prefix: Option<String>,
    max_response_size: usize,
    max_compressed_response_size: usize,
    json_content_type: String,
    ndjson_content_type: String,
    accept: String,
    redaction: Redaction,
    retry_backoff: Arc<BackoffFn>,
    product_check: Option<String>,
    generate_request_id: Arc<dyn Fn() -> String + Send + Sync>,
    context: Option<Value>,
    serializer: Serializer,
    sniffer: Option<Arc<dyn SniffAction>>,
}

impl TransportBuilder {
    pub fn new(pool: Arc<dyn ConnectionPool>) -> Self {
        TransportBuilder {
            pool,
            name: "shoal".to_owned(),
            headers: HeaderMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            retry_on_timeout: false,
            compression: false,
            sniff_interval: None,
            sniff_on_connection_fault: false,
            sniff_on_start: false,
            sniff_endpoint: DEFAULT_SNIFF_ENDPOINT.to_owned(),
            node_filter: None,
            node_selector: None,
            opaque_id_prefix: None,
            max_response_size: MAX_TEXT_RESPONSE_BYTES,
            max_compressed_response_size: MAX_RAW_RESPONSE_BYTES,
            json_content_type: DEFAULT_JSON_CONTENT_TYPE.to_owned(),
            ndjson_content_type: DEFAULT_NDJSON_CONTENT_TYPE.to_owned(),
            accept: DEFAULT_ACCEPT.to_owned(),
            redaction: Redaction::default(),
            retry_backoff: Arc::new(equal_jitter_backoff),
            product_check: None,
            generate_request_id: Arc::new(|| uuid::Uuid::new_v4().to_string()),
            context: None,
            serializer: Serializer::default(),
            sniffer: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `None` disables the per-request deadline entirely.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    pub fn compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    pub fn sniff_interval(mut self, interval: Option<Duration>) -> Self {
        self.sniff_interval = interval;
        self
    }

    pub fn sniff_on_connection_fault(mut self, enabled: bool) -> Self {
        self.sniff_on_connection_fault = enabled;
        self
    }

    pub fn sniff_on_start(mut self, enabled: bool) -> Self {
        self.sniff_on_start = enabled;
        self
    }

    pub fn sniff_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.sniff_endpoint = endpoint.into();
        self
    }

    pub fn node_filter(mut self, filter: crate::pool::NodeFilter) -> Self {
        self.node_filter = Some(filter);
        self
    }

    pub fn node_selector(mut self, selector: crate::pool::NodeSelector) -> Self {
        self.node_selector = Some(selector);
        self
    }

    pub fn opaque_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.opaque_id_prefix = Some(prefix.into());
        self
    }

    pub fn max_response_size(mut self, bytes: usize) -> Self {
        self.max_response_size = bytes;
        self
    }

    pub fn max_compressed_response_size(mut self, bytes: usize) -> Self {
        self.max_compressed_response_size = bytes;
        self
    }

    /// Vendored content-type overrides.
    pub fn content_types(
        mut self,
        json: impl Into<String>,
        ndjson: impl Into<String>,
        accept: impl Into<String>,
    ) -> Self {
        self.json_content_type = json.into();
        self.ndjson_content_type = ndjson.into();
        self.accept = accept.into();
        self
    }

    pub fn redaction(mut self, redaction: Redaction) -> Self {
        self.redaction = redaction;
        self
    }

    pub fn retry_backoff(
        mut self,
        backoff: impl Fn(u32, u32, u32) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.retry_backoff = Arc::new(backoff);
        self
    }

    /// Expected `x-elastic-product` value on 2xx responses.
    pub fn product_check(mut self, product: impl Into<String>) -> Self {
        self.product_check = Some(product.into());
        self
    }

    pub fn generate_request_id(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.generate_request_id = Arc::new(generator);
        self
    }

    pub fn context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn serializer(mut self, serializer: Serializer) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn sniffer(mut self, sniffer: Arc<dyn SniffAction>) -> Self {
        self.sniffer = Some(sniffer);
        self
    }

    pub fn build(self) -> Result<Transport, Error> {
        if let Some(interval) = self.sniff_interval {
            if interval.is_zero() {
                return Err(Error::Configuration(
                    "sniff_interval must be a positive duration".to_owned(),
                ));
            }
        }
        if self.max_response_size == 0 || self.max_response_size > MAX_TEXT_RESPONSE_BYTES {
            return Err(Error::Configuration(format!(
                "max_response_size must be within 1..={MAX_TEXT_RESPONSE_BYTES} bytes"
            )));
        }
        if self.max_compressed_response_size == 0
            || self.max_compressed_response_size > MAX_RAW_RESPONSE_BYTES
        {
            return Err(Error::Configuration(format!(
                "max_compressed_response_size must be within 1..={MAX_RAW_RESPONSE_BYTES} bytes"
            )));
        }

        let mut base_headers = HeaderMap::new();
        base_headers.insert("user-agent".to_owned(), USER_AGENT.to_owned());
        base_headers.insert("x-elastic-client-meta".to_owned(), CLIENT_META.to_owned());
        base_headers.insert("accept".to_owned(), self.accept.clone());
        base_headers.insert("accept-encoding".to_owned(), "gzip,deflate".to_owned());
        for (name, value) in normalize_headers(&self.headers) {
            base_headers.insert(name, value);
        }

        let selection = SelectionOptions {
            filter: self
                .node_filter
                .unwrap_or_else(crate::pool::default_node_filter),
            selector: self
                .node_selector
                .unwrap_or_else(crate::pool::round_robin_selector),
        };

        let diagnostics = Arc::clone(self.pool.diagnostics());
        let inner = Arc::new(Inner {
            pool: self.pool,
            codec: self.serializer,
            diagnostics,
            selection,
            name: self.name,
            base_headers,
            max_retries: self.max_retries,
            request_timeout: self.request_timeout,
            retry_on_timeout: self.retry_on_timeout,
            compression: self.compression,
            redaction: self.redaction,
            opaque_id_prefix: self.opaque_id_prefix,
            max_response_size: self.max_response_size,
            max_compressed_response_size: self.max_compressed_response_size,
            json_content_type: self.json_content_type,
            ndjson_content_type: self.ndjson_content_type,
            product_check: self.product_check,
            generate_request_id: self.generate_request_id,
            retry_backoff: self.retry_backoff,
            context: self.context,
            sniff: SniffState::new(
                self.sniff_interval,
                self.sniff_on_connection_fault,
                self.sniff_on_start,
                self.sniff_endpoint,
            ),
            sniffer: self.sniffer,
        });
        let transport = Transport { inner };
        if transport.inner.sniff.on_start
            && tokio::runtime::Handle::try_current().is_ok()
        {
            transport.sniff(SniffReason::SniffOnStart);
        }
        Ok(transport)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) codec: Serializer,
    pub(crate) diagnostics: Arc<Diagnostics>,
    pub(crate) selection: SelectionOptions,
    name: String,
    base_headers: HeaderMap,
    max_retries: u32,
    pub(crate) request_timeout: Option<Duration>,
    retry_on_timeout: bool,
    compression: bool,
    redaction: Redaction,
    opaque_id_prefix: Option<String>,
    pub(crate) max_response_size: usize,
    pub(crate) max_compressed_response_size: usize,
    json_content_type: String,
    ndjson_content_type: String,
    product_check: Option<String>,
    generate_request_id: Arc<dyn Fn() -> String + Send + Sync>,
    retry_backoff: Arc<BackoffFn>,
    context: Option<Value>,
    pub(crate) sniff: SniffState,
    pub(crate) sniffer: Option<Arc<dyn SniffAction>>,
}

/// Cluster-aware request dispatcher. Cheap to clone; clones share the pool,
/// the diagnostics bus, and the sniffing coordinator.
#[derive(Clone)]
pub struct Transport {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("pool", &self.inner.pool)
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn builder(pool: Arc<dyn ConnectionPool>) -> TransportBuilder {
        TransportBuilder::new(pool)
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.inner.diagnostics
    }

    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.inner.pool
    }

    /// Dispatch one request to the fleet.
    pub async fn request(
        &self,
        params: RequestParams,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        let inner = &self.inner;
        let redaction = options
            .redaction
            .clone()
            .unwrap_or_else(|| inner.redaction.clone());
        let retry_on_timeout = options.retry_on_timeout.unwrap_or(inner.retry_on_timeout);
        let compression = options.compression.unwrap_or(inner.compression);
        let timeout = options.timeout.or(inner.request_timeout);
        let max_text = options
            .max_response_size
            .unwrap_or(inner.max_response_size);
        let max_raw = options
            .max_compressed_response_size
            .unwrap_or(inner.max_compressed_response_size);

        let RequestParams {
            method,
            path,
            body,
            querystring,
        } = params;
        let querystring = qserialize(querystring.as_ref());

        // Header composition: defaults < per-request < opaque-id < body MIME
        // < compression. Later layers win.
        let mut headers = inner.base_headers.clone();
        if let Some(request_headers) = &options.headers {
            for (name, value) in normalize_headers(request_headers) {
                headers.insert(name, value);
            }
        }
        if let Some(opaque_id) = &options.opaque_id {
            let value = match &inner.opaque_id_prefix {
                Some(prefix) => format!("{prefix}{opaque_id}"),
                None => opaque_id.clone(),
            };
            headers.insert("x-opaque-id".to_owned(), value);
        }

        let mut meta = RequestMeta {
            request_id: options
                .request_id
                .clone()
                .unwrap_or_else(|| (inner.generate_request_id)()),
            name: inner.name.clone(),
            context: merge_context(inner.context.as_ref(), options.context.as_ref()),
            attempts: 0,
            aborted: false,
            connection: None,
            request: MetaRequest {
                method: method.clone(),
                path: path.clone(),
                querystring: querystring.clone(),
                headers: HeaderMap::new(),
                options: options_snapshot(&options),
            },
            sniff: None,
        };

        inner
            .diagnostics
            .emit(EventKind::Serialization, None, Some(&EventPayload::Meta(&meta)));

        let mut prepared = match prepare_body(inner, body, &mut headers, compression) {
            Ok(prepared) => prepared,
            Err(error) => {
                redaction.apply(&mut meta);
                inner.diagnostics.emit(
                    EventKind::Request,
                    Some(&error),
                    Some(&EventPayload::Meta(&meta)),
                );
                return Err(error);
            }
        };
        meta.request.headers = headers.clone();

        // A stream can be shipped once: no replay, no retries.
        let max_retries = if prepared.is_stream() {
            0
        } else {
            options.max_retries.unwrap_or(inner.max_retries)
        };

        let mut attempt: u32 = 0;
        loop {
            // Cancellation is sticky: checked before every attempt.
            if options.signal.as_ref().is_some_and(|s| s.is_cancelled()) {
                meta.aborted = true;
                let error = Error::RequestAborted {
                    message: "request aborted by the caller".to_owned(),
                    meta: None,
                }
                .with_meta(meta.clone(), &redaction);
                self.emit_failure(&error, &meta);
                return Err(error);
            }

            self.maybe_interval_sniff();

            let Some(conn) = inner.pool.get_connection(&inner.selection).await else {
                let error = Error::NoLivingConnections { meta: None }
                    .with_meta(meta.clone(), &redaction);
                self.emit_failure(&error, &meta);
                return Err(error);
            };
            meta.connection = Some(conn.snapshot());
            inner
                .diagnostics
                .emit(EventKind::Request, None, Some(&EventPayload::Meta(&meta)));

            let result = conn
                .request(
                    ConnectionRequest {
                        method: method.clone(),
                        path: path.clone(),
                        querystring: querystring.clone(),
                        headers: headers.clone(),
                        body: prepared.take(),
                    },
                    ConnectionRequestOptions {
                        timeout,
                        signal: options.signal.clone(),
                        as_stream: options.as_stream,
                        max_response_size: Some(max_text),
                        max_compressed_response_size: Some(max_raw),
                    },
                )
                .await;

            let conn_response = match result {
                Ok(conn_response) => conn_response,
                Err(error) => {
                    match classify_failure(&error, retry_on_timeout) {
                        FailureClass::Aborted => {
                            meta.aborted = true;
                            let error = error.with_meta(meta.clone(), &redaction);
                            self.emit_failure(&error, &meta);
                            return Err(error);
                        }
                        FailureClass::Retryable => {
                            inner.pool.mark_dead(&conn);
                            self.maybe_fault_sniff();
                            if attempt < max_retries {
                                attempt += 1;
                                meta.attempts = attempt;
                                self.backoff_if_due(attempt, options.retry_backoff.as_deref())
                                    .await;
                                continue;
                            }
                            let error = error.with_meta(meta.clone(), &redaction);
                            self.emit_failure(&error, &meta);
                            return Err(error);
                        }
                        FailureClass::Terminal => {
                            let error = error.with_meta(meta.clone(), &redaction);
                            self.emit_failure(&error, &meta);
                            return Err(error);
                        }
                    }
                }
            };

            let status = conn_response.status;
            let response_headers = conn_response.headers;

            // Cloud gateway routing attributes, when present.
            if let Some(cluster) = response_headers.get("x-found-handling-cluster") {
                tracing::debug!(
                    request_id = %meta.request_id,
                    handling_cluster = %cluster,
                    handling_instance = response_headers
                        .get("x-found-handling-instance")
                        .map(String::as_str)
                        .unwrap_or(""),
                    "request handled by cloud gateway"
                );
            }

            if let Some(product) = &inner.product_check {
                if (200..300).contains(&status)
                    && response_headers.get(PRODUCT_HEADER) != Some(product)
                {
                    let error = Error::ProductNotSupported {
                        message: format!(
                            "the server is not a supported product; expected it to identify as {product}"
                        ),
                        meta: None,
                    }
                    .with_meta(meta.clone(), &redaction);
                    self.emit_failure(&error, &meta);
                    return Err(error);
                }
            }

            let warnings = parse_warnings(&response_headers);

            if options.as_stream {
                let body = match conn_response.body {
                    ConnectionBody::Stream(stream) => ResponseBody::Stream(stream),
                    ConnectionBody::Bytes(bytes) => {
                        ResponseBody::Stream(one_chunk_stream(bytes))
                    }
                    ConnectionBody::Text(text) => {
                        ResponseBody::Stream(one_chunk_stream(Bytes::from(text)))
                    }
                };
                let response = Response {
                    body,
                    status_code: status,
                    headers: response_headers,
                    warnings,
                    meta: meta.clone(),
                };
                inner.diagnostics.emit(
                    EventKind::Response,
                    None,
                    Some(&EventPayload::Response(&response)),
                );
                return Ok(response);
            }

            let body = match self.decode_body(conn_response.body, &response_headers, &method, status, &meta) {
                Ok(body) => body,
                Err(error) => {
                    self.emit_failure(&error, &meta);
                    return Err(error);
                }
            };

            let ignored = options.ignore.contains(&status) || (method == "HEAD" && status == 404);

            if !ignored && matches!(status, 502 | 503 | 504) {
                inner.pool.mark_dead(&conn);
                if attempt < max_retries {
                    attempt += 1;
                    meta.attempts = attempt;
                    continue;
                }
                let mut response = Response {
                    body,
                    status_code: status,
                    headers: response_headers,
                    warnings,
                    meta: meta.clone(),
                };
                redaction.apply_response(&mut response);
                let error = Error::Response(Box::new(response));
                self.emit_failure(&error, &meta);
                return Err(error);
            }

            inner.pool.mark_alive(&conn);

            if !ignored && status >= 400 {
                let mut response = Response {
                    body,
                    status_code: status,
                    headers: response_headers,
                    warnings,
                    meta: meta.clone(),
                };
                redaction.apply_response(&mut response);
                let error = Error::Response(Box::new(response));
                self.emit_failure(&error, &meta);
                return Err(error);
            }

            let response = Response {
                body,
                status_code: status,
                headers: response_headers,
                warnings,
                meta: meta.clone(),
            };
            inner.diagnostics.emit(
                EventKind::Response,
                None,
                Some(&EventPayload::Response(&response)),
            );
            return Ok(response);
        }
    }

    /// Backoff applies only once every node has had a chance.
    async fn backoff_if_due(&self, attempt: u32, override_fn: Option<&BackoffFn>) {
        if (attempt as usize) < self.inner.pool.size() {
            return;
        }
        let backoff = override_fn.unwrap_or(&*self.inner.retry_backoff);
        let wait = backoff(BACKOFF_MIN_SECONDS, BACKOFF_MAX_SECONDS, attempt);
        if wait > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }

    fn decode_body(
        &self,
        body: ConnectionBody,
        headers: &HeaderMap,
        method: &str,
        status: u16,
        meta: &RequestMeta,
    ) -> Result<ResponseBody, Error> {
        let content_type = headers.get("content-type").cloned().unwrap_or_default();

        let decoded = match body {
            ConnectionBody::Text(text) => ResponseBody::Text(text),
            ConnectionBody::Bytes(bytes) => {
                let bytes = if is_compressed(headers) {
                    let encoding = headers
                        .get("content-encoding")
                        .cloned()
                        .unwrap_or_default();
                    Bytes::from(decompress(&bytes, &encoding)?)
                } else {
                    bytes
                };
                if is_binary_content_type(&content_type) {
                    ResponseBody::Binary(bytes)
                } else {
                    ResponseBody::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
            }
            ConnectionBody::Stream(_) => {
                return Err(Error::Connection {
                    message: "unexpected stream body on a buffered response".to_owned(),
                    meta: None,
                });
            }
        };

        if method == "HEAD" {
            return Ok(ResponseBody::Bool(status < 400));
        }

        if let ResponseBody::Text(text) = &decoded {
            if !text.is_empty() && is_json_content_type(&content_type) {
                self.inner.diagnostics.emit(
                    EventKind::Deserialization,
                    None,
                    Some(&EventPayload::Meta(meta)),
                );
                let value = self.inner.codec.deserialize(text)?;
                return Ok(ResponseBody::Json(value));
            }
        }
        Ok(decoded)
    }

    fn emit_failure(&self, error: &Error, fallback: &RequestMeta) {
        let payload = match error.meta() {
            Some(meta) => EventPayload::Meta(meta),
            None => EventPayload::Meta(fallback),
        };
        self.inner
            .diagnostics
            .emit(EventKind::Response, Some(error), Some(&payload));
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

enum FailureClass {
    Aborted,
    Retryable,
    Terminal,
}

fn classify_failure(error: &Error, retry_on_timeout: bool) -> FailureClass {
    match error {
        Error::RequestAborted { .. } => FailureClass::Aborted,
        Error::Connection { .. } => FailureClass::Retryable,
        Error::Timeout { .. } if retry_on_timeout => FailureClass::Retryable,
        _ => FailureClass::Terminal,
    }
}

// ---------------------------------------------------------------------------
// Body preparation
// ---------------------------------------------------------------------------

enum PreparedBody {
    Empty,
    Bytes(Bytes),
    Stream(Option<BodyStream>),
}

impl PreparedBody {
    fn is_stream(&self) -> bool {
        matches!(self, PreparedBody::Stream(_))
    }

    fn take(&mut self) -> Option<WireBody> {
        match self {
            PreparedBody::Empty => None,
            PreparedBody::Bytes(bytes) => Some(WireBody::Bytes(bytes.clone())),
            PreparedBody::Stream(stream) => stream.take().map(WireBody::Stream),
        }
    }
}

fn prepare_body(
    inner: &Inner,
    body: Option<Body>,
    headers: &mut HeaderMap,
    compression: bool,
) -> Result<PreparedBody, Error> {
    let staged = match body {
        None => return Ok(PreparedBody::Empty),
        Some(Body::Json(value)) => {
            let text = inner.codec.serialize(&value)?;
            headers
                .entry("content-type".to_owned())
                .or_insert_with(|| inner.json_content_type.clone());
            Bytes::from(text)
        }
        Some(Body::NdJson(lines)) => {
            let text = inner.codec.ndserialize(&lines)?;
            headers
                .entry("content-type".to_owned())
                .or_insert_with(|| inner.ndjson_content_type.clone());
            Bytes::from(text)
        }
        Some(Body::Text(text)) => {
            if !text.is_empty() {
                headers
                    .entry("content-type".to_owned())
                    .or_insert_with(|| "text/plain".to_owned());
            }
            Bytes::from(text)
        }
        Some(Body::Bytes(bytes)) => bytes,
        Some(Body::Stream(stream)) => {
            let stream = if compression {
                headers.insert("content-encoding".to_owned(), "gzip".to_owned());
                gzip_stream(stream)
            } else {
                stream
            };
            return Ok(PreparedBody::Stream(Some(stream)));
        }
    };

    let staged = if compression && !staged.is_empty() {
        let compressed = gzip_bytes(&staged).map_err(|e| Error::Configuration(format!(
            "request body compression failed: {e}"
        )))?;
        headers.insert("content-encoding".to_owned(), "gzip".to_owned());
        Bytes::from(compressed)
    } else {
        staged
    };
    headers.insert("content-length".to_owned(), staged.len().to_string());
    Ok(PreparedBody::Bytes(staged))
}

fn gzip_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gzip_stream(stream: BodyStream) -> BodyStream {
    let reader = tokio_util::io::StreamReader::new(stream);
    let encoder = async_compression::tokio::bufread::GzipEncoder::new(reader);
    Box::pin(tokio_util::io::ReaderStream::new(encoder))
}

fn decompress(bytes: &[u8], encoding: &str) -> Result<Vec<u8>, Error> {
    use std::io::Read;
    let mut out = Vec::new();
    let result = if encoding.contains("gzip") {
        flate2::read::MultiGzDecoder::new(bytes).read_to_end(&mut out)
    } else {
        flate2::read::ZlibDecoder::new(bytes).read_to_end(&mut out)
    };
    result.map_err(|e| {
        Error::from(DeserializationError {
            message: format!("unable to decompress response body ({encoding}): {e}"),
            data: String::new(),
        })
    })?;
    Ok(out)
}

fn one_chunk_stream(bytes: Bytes) -> BodyStream {
    Box::pin(futures_util::stream::iter(std::iter::once(Ok::<
        _,
        std::io::Error,
    >(bytes))))
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    essence == "application/json" || essence == "application/vnd.elasticsearch+json"
}

fn merge_context(global: Option<&Value>, local: Option<&Value>) -> Option<Value> {
    match (global, local) {
        (None, None) => None,
        (Some(g), None) => Some(g.clone()),
        (None, Some(l)) => Some(l.clone()),
        (Some(Value::Object(g)), Some(Value::Object(l))) => {
            let mut merged = g.clone();
            for (key, value) in l {
                merged.insert(key.clone(), value.clone());
            }
            Some(Value::Object(merged))
        }
        // A non-mergeable local context wins outright.
        (Some(_), Some(l)) => Some(l.clone()),
    }
}

fn options_snapshot(options: &RequestOptions) -> Value {
    json!({
        "timeout_ms": options.timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        "max_retries": options.max_retries,
        "compression": options.compression,
        "as_stream": options.as_stream,
        "ignore": options.ignore,
        "opaque_id": options.opaque_id,
    })
}
