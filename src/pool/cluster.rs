//! The default pool: alive/dead bookkeeping with scheduled resurrection.
//!
//! Dead connections queue up ordered by their resurrection deadline. Before
//! every selection the head of the queue is checked; a due connection is
//! probed (or optimistically restored) and the outcome published as a
//! `resurrect` diagnostic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{ConnectionPool, PoolCore, PoolOptions, SelectionOptions};
use crate::connection::{
    Connection, ConnectionRequest, ConnectionRequestOptions, NodeSpec, NodeStatus,
};
use crate::diagnostics::{Diagnostics, EventKind, EventPayload, ResurrectEvent};
use crate::errors::Error;
use crate::meta::HeaderMap;

/// Delay before the first resurrection attempt; doubles per failure.
const BASE_RESURRECT_DELAY: Duration = Duration::from_secs(60);
/// The doubling stops growing past this exponent.
const MAX_DELAY_EXPONENT: u32 = 5;
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(3);

/// How a due dead connection is brought back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResurrectStrategy {
    /// Leave dead connections alone (selection still falls back to them).
    None,
    /// Probe with a HEAD request before restoring.
    #[default]
    Ping,
    /// Restore without probing.
    Optimistic,
}

impl ResurrectStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResurrectStrategy::None => "none",
            ResurrectStrategy::Ping => "ping",
            ResurrectStrategy::Optimistic => "optimistic",
        }
    }
}

struct DeadEntry {
    resurrect_at: Instant,
    id: String,
}

pub struct ClusterPool {
    core: PoolCore,
    /// Ascending by `resurrect_at`; sort-on-insert.
    dead: Mutex<Vec<DeadEntry>>,
    strategy: ResurrectStrategy,
    ping_timeout: Duration,
}

impl std::fmt::Debug for ClusterPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterPool")
            .field("size", &self.core.connections().len())
            .field("dead", &self.dead.lock().map(|d| d.len()).unwrap_or(0))
            .field("strategy", &self.strategy)
            .finish()
    }
}

impl ClusterPool {
    pub fn new(options: PoolOptions) -> Self {
        ClusterPool {
            core: PoolCore::new(options),
            dead: Mutex::new(Vec::new()),
            strategy: ResurrectStrategy::default(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_resurrect_strategy(mut self, strategy: ResurrectStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Ids currently queued for resurrection, in deadline order.
    pub fn dead_ids(&self) -> Vec<String> {
        self.lock_dead().iter().map(|e| e.id.clone()).collect()
    }

    fn lock_dead(&self) -> std::sync::MutexGuard<'_, Vec<DeadEntry>> {
        self.dead.lock().expect("dead list lock poisoned")
    }

    /// Process the head of the dead queue if its deadline has passed.
    ///
    /// The entry is claimed under the lock, so concurrent selections never
    /// double-probe one connection.
    async fn resurrect(&self, now: Instant) {
        if self.strategy == ResurrectStrategy::None {
            return;
        }
        let due = {
            let mut dead = self.lock_dead();
            match dead.first() {
                Some(head) if head.resurrect_at <= now => Some(dead.remove(0)),
                _ => None,
            }
        };
        let Some(entry) = due else { return };
        let Some(conn) = self
            .core
            .connections()
            .into_iter()
            .find(|c| c.id() == entry.id)
        else {
            // The node left the pool while queued; nothing to restore.
            return;
        };

        match self.strategy {
            ResurrectStrategy::None => {}
            ResurrectStrategy::Optimistic => {
                self.mark_alive(&conn);
                self.emit_resurrect(None, &conn, true);
            }
            ResurrectStrategy::Ping => {
                let result = conn
                    .request(
                        ConnectionRequest {
                            method: "HEAD".to_owned(),
                            path: "/".to_owned(),
                            querystring: String::new(),
                            headers: HeaderMap::new(),
                            body: None,
                        },
                        ConnectionRequestOptions {
                            timeout: Some(self.ping_timeout),
                            ..Default::default()
                        },
                    )
                    .await;
                match result {
                    Ok(response) if response.status >= 500 => {
                        self.mark_dead(&conn);
                        self.emit_resurrect(None, &conn, false);
                    }
                    Ok(_) => {
                        self.mark_alive(&conn);
                        self.emit_resurrect(None, &conn, true);
                    }
                    Err(error) => {
                        self.mark_dead(&conn);
                        self.emit_resurrect(Some(&error), &conn, false);
                    }
                }
            }
        }
    }

    fn emit_resurrect(&self, error: Option<&Error>, conn: &Arc<Connection>, is_alive: bool) {
        let event = ResurrectEvent {
            strategy: self.strategy,
            is_alive,
            connection: conn.snapshot(),
        };
        self.core
            .diagnostics
            .emit(EventKind::Resurrect, error, Some(&EventPayload::Resurrect(&event)));
    }
}

#[async_trait]
impl ConnectionPool for ClusterPool {
    fn add_connection(&self, spec: NodeSpec) -> Result<Arc<Connection>, Error> {
        self.core.add(spec)
    }

    fn remove_connection(&self, id: &str) -> bool {
        let removed = self.core.remove(id).is_some();
        if removed {
            self.lock_dead().retain(|e| e.id != id);
        }
        removed
    }

    fn update(&self, nodes: Vec<NodeSpec>) {
        let _removed = self.core.update(nodes);
        let mut dead = self.lock_dead();
        dead.retain(|e| self.core.contains_id(&e.id));
    }

    async fn empty(&self) {
        self.lock_dead().clear();
        self.core.empty().await;
    }

    fn mark_alive(&self, conn: &Arc<Connection>) {
        let id = conn.id();
        self.lock_dead().retain(|e| e.id != id);
        conn.mark_alive_state();
    }

    fn mark_dead(&self, conn: &Arc<Connection>) {
        let id = conn.id();
        let dead_count = conn.mark_dead_state();
        if !self.core.contains_id(&id) {
            return;
        }
        let exponent = (dead_count - 1).min(MAX_DELAY_EXPONENT);
        let resurrect_at = Instant::now() + BASE_RESURRECT_DELAY * 2_u32.pow(exponent);
        conn.set_resurrect_at(resurrect_at);

        let mut dead = self.lock_dead();
        dead.retain(|e| e.id != id);
        let position = dead.partition_point(|e| e.resurrect_at <= resurrect_at);
        dead.insert(position, DeadEntry { resurrect_at, id });
    }

    async fn get_connection(&self, options: &SelectionOptions) -> Option<Arc<Connection>> {
        self.resurrect(Instant::now()).await;
        let connections = self.core.connections();
        let alive: Vec<Arc<Connection>> = connections
            .iter()
            .filter(|c| c.status() == NodeStatus::Alive && (options.filter)(c))
            .cloned()
            .collect();
        // With nothing alive, a dead connection is still worth one attempt.
        let candidates = if alive.is_empty() {
            connections
                .iter()
                .filter(|c| (options.filter)(c))
                .cloned()
                .collect()
        } else {
            alive
        };
        if candidates.is_empty() {
            return None;
        }
        let index = (options.selector)(&candidates) % candidates.len();
        candidates.get(index).cloned()
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections()
    }

    fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.core.diagnostics
    }
}
