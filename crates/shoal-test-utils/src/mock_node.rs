//! A mock fleet node: a real TCP listener speaking minimal HTTP/1.1.
//!
//! Binds to port 0 (random) and exposes the bound address. Each test can
//! spin up its own isolated node. Responses come from a handler closure;
//! connections are kept alive until the handler asks for a close.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// A parsed incoming request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path plus querystring, exactly as sent.
    pub target: String,
    /// Lowercase header names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// A canned response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Close the connection after this response.
    pub close: bool,
}

impl HttpResponse {
    pub fn status(status: u16) -> Self {
        HttpResponse {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            close: false,
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        HttpResponse::status(status)
            .with_header("content-type", "text/plain")
            .with_body(body.as_bytes().to_vec())
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        HttpResponse::status(status)
            .with_header("content-type", "application/json")
            .with_body(body.to_string().into_bytes())
    }

    /// A gzip-compressed JSON response announcing `content-encoding`.
    pub fn gzip_json(status: u16, body: &serde_json::Value) -> Self {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(body.to_string().as_bytes())
            .expect("gzip write");
        let compressed = encoder.finish().expect("gzip finish");
        HttpResponse::status(status)
            .with_header("content-type", "application/json")
            .with_header("content-encoding", "gzip")
            .with_body(compressed)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn with_close(mut self) -> Self {
        self.close = true;
        self
    }
}

pub type Handler = Arc<dyn Fn(HttpRequest) -> HttpResponse + Send + Sync>;

pub struct MockNode {
    addr: SocketAddr,
    /// Dropped with the node; aborts the accept loop.
    _task: tokio::task::JoinHandle<()>,
}

impl MockNode {
    /// Start the node, binding to a random available port.
    pub async fn start(
        handler: impl Fn(HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handler: Handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            // Client disconnects are routine in tests.
                            let _ = Self::serve_connection(stream, handler).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(MockNode { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn serve_connection(mut stream: TcpStream, handler: Handler) -> std::io::Result<()> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let request = match read_request(&mut stream, &mut buf).await? {
                Some(request) => request,
                None => return Ok(()), // clean disconnect
            };
            let response = handler(request);
            let close = response.close;
            write_response(&mut stream, response).await?;
            if close {
                return Ok(());
            }
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self._task.abort();
    }
}

/// Read one request from the stream. Returns `None` on a clean EOF before
/// any bytes of a new request.
async fn read_request(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<HttpRequest>> {
    let head_end = loop {
        if let Some(pos) = find_head_end(buf) {
            break pos;
        }
        let mut chunk = [0_u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default().to_owned();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let mut chunk = [0_u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-body",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body = buf[body_start..body_start + content_length].to_vec();
    buf.drain(..body_start + content_length);

    Ok(Some(HttpRequest {
        method,
        target,
        headers,
        body,
    }))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(stream: &mut TcpStream, response: HttpResponse) -> std::io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Status",
    };
    let mut head = format!("HTTP/1.1 {} {}\r\n", response.status, reason);
    let mut has_content_length = false;
    let mut has_connection = false;
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            has_content_length = true;
        }
        if name.eq_ignore_ascii_case("connection") {
            has_connection = true;
        }
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    if !has_content_length {
        head.push_str(&format!("content-length: {}\r\n", response.body.len()));
    }
    if !has_connection {
        let value = if response.close { "close" } else { "keep-alive" };
        head.push_str(&format!("connection: {value}\r\n"));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await
}
