//! Stock wire engine backed by reqwest + rustls.
//!
//! One engine instance is built per node URL so every connection owns its
//! keep-alive socket pool and `close` releases exactly that node's sockets.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use url::Url;

use super::pinning::pinned_tls_config;
use super::wire::{
    Wire, WireBody, WireBuilder, WireConfig, WireError, WireOptions, WireRequest, WireResponse,
};
use crate::errors::Error;
use crate::meta::HeaderMap;

pub struct ReqwestWire {
    /// Taken on `close`; a closed engine refuses further requests.
    client: Mutex<Option<reqwest::Client>>,
    target: Url,
}

impl std::fmt::Debug for ReqwestWire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestWire")
            .field("target", &self.target.as_str())
            .finish_non_exhaustive()
    }
}

impl ReqwestWire {
    pub fn new(target: &Url, config: &WireConfig) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(idle) = config.keep_alive_idle {
            builder = builder.pool_idle_timeout(idle);
        }
        if let Some(max_idle) = config.max_idle_per_host {
            builder = builder.pool_max_idle_per_host(max_idle);
        }
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|e| Error::Configuration(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(fingerprint) = &config.ca_fingerprint {
            builder = builder.use_preconfigured_tls(pinned_tls_config(fingerprint)?);
        } else if config.accept_invalid_certs {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| Error::Configuration(format!("unable to build HTTP engine: {e}")))?;
        Ok(ReqwestWire {
            client: Mutex::new(Some(client)),
            target: target.clone(),
        })
    }

    fn client(&self) -> Result<reqwest::Client, WireError> {
        self.client
            .lock()
            .expect("engine lock poisoned")
            .clone()
            .ok_or_else(|| WireError::new("engine is closed"))
    }

    fn endpoint(&self) -> String {
        let host = self.target.host_str().unwrap_or("unknown");
        match self.target.port_or_known_default() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }
}

#[async_trait]
impl Wire for ReqwestWire {
    async fn request(
        &self,
        request: WireRequest,
        options: WireOptions,
    ) -> Result<WireResponse, WireError> {
        let client = self.client()?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| WireError::new(format!("invalid HTTP method '{}': {e}", request.method)))?;

        let mut builder = client.request(method, request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            Some(WireBody::Bytes(bytes)) => builder.body(bytes),
            Some(WireBody::Stream(stream)) => builder.body(reqwest::Body::wrap_stream(stream)),
            None => builder,
        };

        let endpoint = self.endpoint();
        let response = tokio::select! {
            biased;
            () = options.signal.cancelled() => {
                return Err(WireError::new(format!(
                    "exchange cancelled (remote endpoint: {endpoint})"
                )));
            }
            result = builder.send() => result.map_err(|e| {
                WireError::new(format!("{e} (remote endpoint: {endpoint})"))
            })?,
        };

        let status = response.status().as_u16();
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_ascii_lowercase())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let body = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()));
        Ok(WireResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }

    async fn close(&self) {
        // Dropping the client tears down its connection pool.
        self.client.lock().expect("engine lock poisoned").take();
    }
}

/// The default `WireBuilder`: one reqwest engine per node.
pub fn reqwest_wire_builder(config: WireConfig) -> WireBuilder {
    Arc::new(move |url: &Url| {
        let wire = ReqwestWire::new(url, &config)?;
        Ok(Arc::new(wire) as Arc<dyn Wire>)
    })
}
