//! In-memory wire engine with a scripted exchange queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use url::Url;

use shoal::connection::{
    Wire, WireBody, WireBuilder, WireError, WireOptions, WireRequest, WireResponse,
};
use shoal::HeaderMap;

/// One scripted reply: status, headers, and the body as explicit chunks so
/// tests control chunk boundaries.
#[derive(Debug, Clone)]
pub struct MockReply {
    pub status: u16,
    pub headers: HeaderMap,
    pub chunks: Vec<Bytes>,
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        MockReply {
            status,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        MockReply::status(status)
            .with_header("content-type", "text/plain")
            .with_body(Bytes::copy_from_slice(body.as_bytes()))
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        let encoded = body.to_string();
        MockReply::status(status)
            .with_header("content-type", "application/json")
            .with_body(Bytes::from(encoded))
    }

    /// A JSON reply compressed with gzip, announcing `content-encoding`.
    pub fn gzip_json(status: u16, body: &serde_json::Value) -> Self {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(body.to_string().as_bytes())
            .expect("gzip write");
        let compressed = encoder.finish().expect("gzip finish");
        MockReply::status(status)
            .with_header("content-type", "application/json")
            .with_header("content-encoding", "gzip")
            .with_body(Bytes::from(compressed))
    }

    pub fn bytes(status: u16, content_type: &str, body: Bytes) -> Self {
        MockReply::status(status)
            .with_header("content-type", content_type)
            .with_body(body)
    }

    /// Body delivered in explicit chunks, with no `content-length` announced.
    pub fn chunked(status: u16, chunks: Vec<Bytes>) -> Self {
        MockReply {
            status,
            headers: HeaderMap::new(),
            chunks,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_owned(), value.to_owned());
        self
    }

    fn with_body(mut self, body: Bytes) -> Self {
        self.headers
            .insert("content-length".to_owned(), body.len().to_string());
        self.chunks = vec![body];
        self
    }
}

/// A scripted engine-level outcome.
#[derive(Debug, Clone)]
pub enum MockExchange {
    Reply(MockReply),
    /// Engine error (socket-level failure).
    Fail(String),
    /// Stay pending until the exchange is cancelled.
    Hang,
}

/// What the engine saw for one call, with the request body drained.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

#[derive(Debug, Default)]
pub struct MockWire {
    script: Mutex<VecDeque<MockExchange>>,
    /// Served when the script runs dry; a plain 200 when unset.
    default_exchange: Mutex<Option<MockExchange>>,
    calls: Mutex<Vec<RecordedCall>>,
    closed: std::sync::atomic::AtomicBool,
}

impl MockWire {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(MockWire::default())
    }

    pub fn enqueue(&self, exchange: MockExchange) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(exchange);
    }

    pub fn push_reply(&self, reply: MockReply) {
        self.enqueue(MockExchange::Reply(reply));
    }

    pub fn push_error(&self, message: &str) {
        self.enqueue(MockExchange::Fail(message.to_owned()));
    }

    pub fn push_hang(&self) {
        self.enqueue(MockExchange::Hang);
    }

    /// Serve this exchange whenever the script is empty.
    pub fn set_default(&self, exchange: MockExchange) {
        *self
            .default_exchange
            .lock()
            .expect("default lock poisoned") = Some(exchange);
    }

    /// Every unscripted call fails with the given engine error.
    pub fn fail_always(&self, message: &str) {
        self.set_default(MockExchange::Fail(message.to_owned()));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock poisoned").len()
    }

    /// Whether `close` has been invoked on this engine.
    pub fn is_closed(&self) -> bool {
        self.closed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Wire for MockWire {
    async fn request(
        &self,
        request: WireRequest,
        options: WireOptions,
    ) -> Result<WireResponse, WireError> {
        let body = match request.body {
            None => None,
            Some(WireBody::Bytes(bytes)) => Some(bytes),
            Some(WireBody::Stream(mut stream)) => {
                let mut collected = Vec::new();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| WireError::new(e.to_string()))?;
                    collected.extend_from_slice(&chunk);
                }
                Some(Bytes::from(collected))
            }
        };
        self.calls.lock().expect("calls lock poisoned").push(RecordedCall {
            method: request.method,
            url: request.url,
            headers: request.headers,
            body,
        });

        let exchange = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .or_else(|| {
                self.default_exchange
                    .lock()
                    .expect("default lock poisoned")
                    .clone()
            })
            .unwrap_or(MockExchange::Reply(MockReply::status(200)));

        match exchange {
            MockExchange::Reply(reply) => {
                let chunks: Vec<Result<Bytes, std::io::Error>> =
                    reply.chunks.into_iter().map(Ok).collect();
                Ok(WireResponse {
                    status: reply.status,
                    headers: reply.headers,
                    body: Box::pin(futures_util::stream::iter(chunks)),
                })
            }
            MockExchange::Fail(message) => Err(WireError::new(message)),
            MockExchange::Hang => {
                options.signal.cancelled().await;
                Err(WireError::new("exchange cancelled"))
            }
        }
    }

    async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// One scripted engine per node key (`host:port`), shared across rebuilds so
/// tests can script a node before the pool dials it.
#[derive(Debug, Default)]
pub struct MockFleet {
    wires: Mutex<HashMap<String, Arc<MockWire>>>,
}

impl MockFleet {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(MockFleet::default())
    }

    /// Get or create the engine for a node key such as `node-1:9200`.
    pub fn wire(&self, key: &str) -> Arc<MockWire> {
        let mut wires = self.wires.lock().expect("fleet lock poisoned");
        Arc::clone(wires.entry(key.to_owned()).or_default())
    }

    /// Total engine calls across the fleet.
    pub fn total_calls(&self) -> usize {
        let wires = self.wires.lock().expect("fleet lock poisoned");
        wires.values().map(|w| w.call_count()).sum()
    }

    pub fn builder(self: &Arc<Self>) -> WireBuilder {
        let fleet = Arc::clone(self);
        Arc::new(move |url: &Url| {
            let key = format!(
                "{}:{}",
                url.host_str().unwrap_or("unknown"),
                url.port_or_known_default().unwrap_or(0)
            );
            Ok(fleet.wire(&key) as Arc<dyn Wire>)
        })
    }
}
