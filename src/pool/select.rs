//! Node filters and selectors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::Connection;

/// Decides whether a node is eligible for a request.
pub type NodeFilter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Picks an index into the eligible connection slice.
pub type NodeSelector = Arc<dyn Fn(&[Arc<Connection>]) -> usize + Send + Sync>;

/// The default filter excludes master-only nodes: a node whose roles include
/// `master` but carry no data tier and no `ingest` should not serve traffic.
/// Nodes reporting no roles pass.
pub fn default_node_filter() -> NodeFilter {
    Arc::new(|conn: &Connection| {
        let roles = conn.roles();
        if roles.is_empty() {
            return true;
        }
        let is_master = roles.iter().any(|r| r == "master");
        let has_data = roles.iter().any(|r| r == "data" || r.starts_with("data_"));
        let has_ingest = roles.iter().any(|r| r == "ingest");
        !(is_master && !has_data && !has_ingest)
    })
}

/// Stateful round-robin: returns connections in rotation across calls.
pub fn round_robin_selector() -> NodeSelector {
    let cursor = Arc::new(AtomicUsize::new(0));
    Arc::new(move |connections: &[Arc<Connection>]| {
        if connections.is_empty() {
            return 0;
        }
        cursor.fetch_add(1, Ordering::Relaxed) % connections.len()
    })
}
