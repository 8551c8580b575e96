//! Single-connection pool for managed (cloud) deployments.
//!
//! A cloud endpoint fronts the whole fleet behind one URL, so there is
//! nothing to select: the one connection is returned regardless of health.

use std::sync::Arc;

use async_trait::async_trait;

use super::{ConnectionPool, PoolCore, PoolOptions, SelectionOptions};
use crate::connection::{Connection, NodeSpec};
use crate::diagnostics::Diagnostics;
use crate::errors::Error;

pub struct CloudPool {
    core: PoolCore,
}

impl std::fmt::Debug for CloudPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudPool")
            .field("size", &self.core.connections().len())
            .finish()
    }
}

impl CloudPool {
    pub fn new(options: PoolOptions) -> Self {
        CloudPool {
            core: PoolCore::new(options),
        }
    }
}

#[async_trait]
impl ConnectionPool for CloudPool {
    /// At most one connection: adding replaces the previous one.
    fn add_connection(&self, spec: NodeSpec) -> Result<Arc<Connection>, Error> {
        self.core.update(vec![spec]);
        self.core
            .connections()
            .pop()
            .ok_or_else(|| Error::Configuration("cloud endpoint could not be built".to_owned()))
    }

    fn remove_connection(&self, id: &str) -> bool {
        self.core.remove(id).is_some()
    }

    fn update(&self, nodes: Vec<NodeSpec>) {
        // Only the first node is meaningful for a cloud endpoint.
        self.core.update(nodes.into_iter().take(1).collect());
    }

    async fn empty(&self) {
        self.core.empty().await;
    }

    fn mark_alive(&self, conn: &Arc<Connection>) {
        conn.mark_alive_state();
    }

    /// Health tracking is pointless behind a load balancer.
    fn mark_dead(&self, _conn: &Arc<Connection>) {}

    async fn get_connection(&self, _options: &SelectionOptions) -> Option<Arc<Connection>> {
        self.core.connections().into_iter().next()
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections()
    }

    fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.core.diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NodeStatus;
    use shoal_test_utils::MockFleet;
    use url::Url;

    #[tokio::test]
    async fn holds_one_connection_and_serves_it_regardless_of_health() {
        let fleet = MockFleet::new();
        let pool = CloudPool::new(PoolOptions::new(fleet.builder()));
        pool.add_connection(NodeSpec::new(
            Url::parse("https://fleet.cloud.example:9243").unwrap(),
        ))
        .unwrap();
        pool.add_connection(NodeSpec::new(
            Url::parse("https://fleet2.cloud.example:9243").unwrap(),
        ))
        .unwrap();
        assert_eq!(pool.size(), 1);

        let conn = pool
            .get_connection(&SelectionOptions::default())
            .await
            .unwrap();
        pool.mark_dead(&conn);
        assert_eq!(conn.status(), NodeStatus::Alive);
        assert!(pool
            .get_connection(&SelectionOptions::default())
            .await
            .is_some());
    }
}
