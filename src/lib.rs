//! Cluster-aware HTTP transport for Elasticsearch-compatible node fleets.
//!
//! The transport takes an application-level request (method, path, body,
//! options) and delivers it to one node of a dynamically maintained pool,
//! applying serialization, compression, authentication, retries with
//! backoff, failure detection, health recovery, optional topology refresh
//! (sniffing), timeouts, cancellation, response-size bounds, product
//! identification, and secret redaction.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shoal::{ClusterPool, PoolOptions, RequestParams, RequestOptions, Transport};
//! use shoal::connection::{reqwest_wire_builder, WireConfig};
//! use shoal::pool::{url_to_host, ConnectionPool};
//!
//! # async fn run() -> Result<(), shoal::Error> {
//! let pool = ClusterPool::new(PoolOptions::new(reqwest_wire_builder(WireConfig::default())));
//! pool.add_connection(url_to_host("http://127.0.0.1:9200")?)?;
//! let transport = Transport::builder(Arc::new(pool)).build()?;
//!
//! let response = transport
//!     .request(RequestParams::new("GET", "/_cluster/health"), RequestOptions::default())
//!     .await?;
//! println!("{:?}", response.body.as_json());
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod diagnostics;
pub mod errors;
pub mod meta;
pub mod pool;
pub mod redact;
pub mod transport;

/// The stock codec crate, re-exported for callers that construct bulk
/// bodies or custom serializers.
pub use shoal_codec as codec;

pub use codec::{BulkLine, PoisonGuard, Query, Serializer};
pub use connection::{Credentials, NodeSpec, WireConfig};
pub use diagnostics::{Diagnostics, EventKind, EventPayload, ListenerId};
pub use errors::Error;
pub use meta::{HeaderMap, RequestMeta, Response, ResponseBody, SniffReason};
pub use pool::{
    CloudPool, ClusterPool, ConnectionPool, PoolOptions, ResurrectStrategy, SelectionOptions,
    WeightedPool,
};
pub use redact::{Redaction, RedactionKind};
pub use transport::{
    equal_jitter_backoff, Body, RequestOptions, RequestParams, SniffAction, Transport,
    TransportBuilder,
};
