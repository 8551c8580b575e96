//! Connection pools: alive/dead bookkeeping, resurrection, node selection.
//!
//! Three variants share one contract. The cluster pool tracks dead nodes and
//! resurrects them on a backoff schedule; the weighted pool encodes health in
//! weighted-round-robin weights; the cloud pool holds a single connection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

mod cloud;
mod cluster;
mod select;
mod weighted;

pub use cloud::CloudPool;
pub use cluster::{ClusterPool, ResurrectStrategy};
pub use select::{default_node_filter, round_robin_selector, NodeFilter, NodeSelector};
pub use weighted::WeightedPool;

use crate::connection::{Connection, Credentials, NodeSpec, WireBuilder};
use crate::diagnostics::Diagnostics;
use crate::errors::Error;

// ---------------------------------------------------------------------------
// Selection options
// ---------------------------------------------------------------------------

/// Filter and selector applied by `get_connection`. The transport builds one
/// of these at construction and reuses it, so stateful selectors keep their
/// rotation across requests.
#[derive(Clone)]
pub struct SelectionOptions {
    pub filter: NodeFilter,
    pub selector: NodeSelector,
}

impl Default for SelectionOptions {
    fn default() -> Self {
        SelectionOptions {
            filter: default_node_filter(),
            selector: round_robin_selector(),
        }
    }
}

impl std::fmt::Debug for SelectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SelectionOptions { .. }")
    }
}

// ---------------------------------------------------------------------------
// Pool contract
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConnectionPool: Send + Sync + std::fmt::Debug {
    /// Add one node. Rejected when a pooled connection already has the id.
    fn add_connection(&self, spec: NodeSpec) -> Result<Arc<Connection>, Error>;

    /// Drop a node by id, closing its engine asynchronously.
    fn remove_connection(&self, id: &str) -> bool;

    /// Reconcile the pool against a freshly sniffed node set.
    fn update(&self, nodes: Vec<NodeSpec>);

    /// Close every connection and clear the pool. Close errors are swallowed.
    async fn empty(&self);

    fn mark_alive(&self, conn: &Arc<Connection>);

    fn mark_dead(&self, conn: &Arc<Connection>);

    /// Pick one connection for a request, or `None` when the filter rejects
    /// every node.
    async fn get_connection(&self, options: &SelectionOptions) -> Option<Arc<Connection>>;

    fn connections(&self) -> Vec<Arc<Connection>>;

    fn size(&self) -> usize {
        self.connections().len()
    }

    /// The diagnostics bus this pool publishes resurrect events on; the
    /// owning transport adopts it so both ends share one bus.
    fn diagnostics(&self) -> &Arc<Diagnostics>;
}

// ---------------------------------------------------------------------------
// Construction options
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PoolOptions {
    pub wire_builder: WireBuilder,
    /// Default credentials for nodes whose spec carries none.
    pub auth: Option<Credentials>,
    pub diagnostics: Arc<Diagnostics>,
}

impl PoolOptions {
    pub fn new(wire_builder: WireBuilder) -> Self {
        PoolOptions {
            wire_builder,
            auth: None,
            diagnostics: Arc::new(Diagnostics::new()),
        }
    }

    pub fn with_auth(mut self, auth: Credentials) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<Diagnostics>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

impl std::fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolOptions")
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Shared core
// ---------------------------------------------------------------------------

/// State and behavior shared by every pool variant.
pub(crate) struct PoolCore {
    connections: Mutex<Vec<Arc<Connection>>>,
    wire_builder: WireBuilder,
    auth: Option<Credentials>,
    pub(crate) diagnostics: Arc<Diagnostics>,
}

impl std::fmt::Debug for PoolCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCore")
            .field("size", &self.connections().len())
            .finish_non_exhaustive()
    }
}

impl PoolCore {
    pub(crate) fn new(options: PoolOptions) -> Self {
        PoolCore {
            connections: Mutex::new(Vec::new()),
            wire_builder: options.wire_builder,
            auth: options.auth,
            diagnostics: options.diagnostics,
        }
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock().clone()
    }

    pub(crate) fn contains_id(&self, id: &str) -> bool {
        self.lock().iter().any(|c| c.id() == id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Connection>>> {
        self.connections.lock().expect("pool lock poisoned")
    }

    fn build_connection(&self, mut spec: NodeSpec) -> Result<Arc<Connection>, Error> {
        if spec.auth.is_none() {
            spec.auth = self.auth.clone();
        }
        let wire = (self.wire_builder)(&spec.url)?;
        Ok(Arc::new(Connection::new(spec, wire)?))
    }

    pub(crate) fn add(&self, spec: NodeSpec) -> Result<Arc<Connection>, Error> {
        let candidate_id = spec_id(&spec);
        let mut list = self.lock();
        if list.iter().any(|c| c.id() == candidate_id) {
            return Err(Error::Configuration(format!(
                "a connection with id '{candidate_id}' is already present"
            )));
        }
        let conn = self.build_connection(spec)?;
        list.push(Arc::clone(&conn));
        Ok(conn)
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Arc<Connection>> {
        let mut list = self.lock();
        let position = list.iter().position(|c| c.id() == id)?;
        let conn = list.remove(position);
        close_async(Arc::clone(&conn));
        Some(conn)
    }

    /// Reconcile against an incoming node set.
    ///
    /// Lookup is by id first, then by credential-free URL (promoting the id
    /// on a URL hit). Retained connections keep their engine (and thus their
    /// socket pool) and flip back to alive. Connections absent from the
    /// incoming set are closed asynchronously.
    pub(crate) fn update(&self, specs: Vec<NodeSpec>) -> Vec<Arc<Connection>> {
        let mut list = self.lock();
        let mut next: Vec<Arc<Connection>> = Vec::with_capacity(specs.len());
        let mut seen_ids: HashSet<String> = HashSet::new();

        for spec in specs {
            let candidate_id = spec_id(&spec);
            if !seen_ids.insert(candidate_id.clone()) {
                continue;
            }
            if let Some(existing) = list.iter().find(|c| c.id() == candidate_id) {
                existing.mark_alive_state();
                next.push(Arc::clone(existing));
                continue;
            }
            let href = stripped_url(&spec.url).to_string();
            if let Some(existing) = list.iter().find(|c| c.url().as_str() == href) {
                existing.set_id(candidate_id);
                existing.mark_alive_state();
                next.push(Arc::clone(existing));
                continue;
            }
            match self.build_connection(spec) {
                Ok(conn) => next.push(conn),
                Err(error) => {
                    tracing::warn!(%error, "skipping unbuildable node from topology update");
                }
            }
        }

        let removed: Vec<Arc<Connection>> = list
            .iter()
            .filter(|old| !next.iter().any(|n| Arc::ptr_eq(n, old)))
            .cloned()
            .collect();
        for conn in &removed {
            close_async(Arc::clone(conn));
        }
        *list = next;
        removed
    }

    pub(crate) async fn empty(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut list = self.lock();
            std::mem::take(&mut *list)
        };
        for conn in drained {
            conn.close().await;
        }
    }
}

/// Close an engine without blocking the caller; failures are swallowed so
/// teardown stays total. Outside a runtime the engine releases on drop.
fn close_async(conn: Arc<Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            conn.close().await;
        });
    }
}

/// The id a spec will resolve to: explicit, or the credential-free URL.
fn spec_id(spec: &NodeSpec) -> String {
    spec.id
        .clone()
        .unwrap_or_else(|| stripped_url(&spec.url).to_string())
}

pub(crate) fn stripped_url(url: &Url) -> Url {
    let mut url = url.clone();
    let _ = url.set_username("");
    let _ = url.set_password(None);
    url
}

// ---------------------------------------------------------------------------
// Host parsing
// ---------------------------------------------------------------------------

/// Normalize a URL string into a node spec.
pub fn url_to_host(raw: &str) -> Result<NodeSpec, Error> {
    let url = Url::parse(raw)
        .map_err(|e| Error::Configuration(format!("invalid node URL '{raw}': {e}")))?;
    Ok(NodeSpec::new(url))
}

/// Parse a sniff response body into node specs.
///
/// Publish addresses come as `ip:port` or `hostname/ip:port` (the second
/// form resolves to the hostname). The protocol is prepended when the
/// address does not carry one. Nodes without an http publish address are
/// skipped.
pub fn nodes_to_host(body: &Value, protocol: &str) -> Vec<NodeSpec> {
    let Some(nodes) = body.get("nodes").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut specs = Vec::with_capacity(nodes.len());
    for (id, node) in nodes {
        let Some(publish_address) = node
            .get("http")
            .and_then(|http| http.get("publish_address"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let address = resolve_publish_address(publish_address);
        let with_protocol = if address.contains("://") {
            address
        } else {
            format!("{protocol}://{address}")
        };
        let url = match Url::parse(&with_protocol) {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%error, publish_address, "skipping unparsable publish address");
                continue;
            }
        };
        let roles = node
            .get("roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let mut spec = NodeSpec::new(url);
        spec.id = Some(id.clone());
        spec.roles = roles;
        specs.push(spec);
    }
    specs
}

/// `hostname/ip:port` → `hostname:port`; `ip:port` stays as-is.
fn resolve_publish_address(publish_address: &str) -> String {
    match publish_address.split_once('/') {
        Some((hostname, ip_and_port)) => match ip_and_port.rsplit_once(':') {
            Some((_, port)) => format!("{hostname}:{port}"),
            None => hostname.to_owned(),
        },
        None => publish_address.to_owned(),
    }
}
