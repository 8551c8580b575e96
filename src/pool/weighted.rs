//! Weighted round-robin pool for stateless fleets.
//!
//! There is no dead queue here: health is encoded in the weights. A failing
//! node's weight decays (so it is picked less), and a recovered node snaps
//! back to the fresh per-node weight.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ConnectionPool, PoolCore, PoolOptions, SelectionOptions};
use crate::connection::{Connection, NodeSpec, NodeStatus};
use crate::diagnostics::Diagnostics;
use crate::errors::Error;

/// Total weight distributed across the pool; each node starts at
/// `round(1000 / size)`.
const TOTAL_WEIGHT: f64 = 1000.0;

struct WrrState {
    /// Rotating cursor; `-1` means the rotation has not started.
    index: i64,
    current_weight: i64,
    max_weight: u32,
    gcd: u32,
}

pub struct WeightedPool {
    core: PoolCore,
    state: Mutex<WrrState>,
}

impl std::fmt::Debug for WeightedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("WeightedPool")
            .field("size", &self.core.connections().len())
            .field("max_weight", &state.max_weight)
            .field("gcd", &state.gcd)
            .finish()
    }
}

impl WeightedPool {
    pub fn new(options: PoolOptions) -> Self {
        WeightedPool {
            core: PoolCore::new(options),
            state: Mutex::new(WrrState {
                index: -1,
                current_weight: 0,
                max_weight: 0,
                gcd: 0,
            }),
        }
    }

    pub fn max_weight(&self) -> u32 {
        self.lock_state().max_weight
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WrrState> {
        self.state.lock().expect("weighted state lock poisoned")
    }

    fn fresh_weight(&self) -> u32 {
        let size = self.core.connections().len();
        if size == 0 {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let weight = (TOTAL_WEIGHT / size as f64).round() as u32;
        weight.max(1)
    }

    fn recompute(&self) {
        let weights: Vec<u32> = self
            .core
            .connections()
            .iter()
            .map(|c| c.weight())
            .collect();
        let mut state = self.lock_state();
        state.max_weight = weights.iter().copied().max().unwrap_or(0);
        state.gcd = weights.into_iter().fold(0, gcd);
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

#[async_trait]
impl ConnectionPool for WeightedPool {
    fn add_connection(&self, spec: NodeSpec) -> Result<Arc<Connection>, Error> {
        let conn = self.core.add(spec)?;
        let fresh = self.fresh_weight();
        for c in self.core.connections() {
            c.set_weight(fresh);
        }
        self.recompute();
        Ok(conn)
    }

    fn remove_connection(&self, id: &str) -> bool {
        let removed = self.core.remove(id).is_some();
        if removed {
            let fresh = self.fresh_weight();
            for c in self.core.connections() {
                c.set_weight(fresh);
            }
            self.recompute();
        }
        removed
    }

    fn update(&self, nodes: Vec<NodeSpec>) {
        let _removed = self.core.update(nodes);
        let fresh = self.fresh_weight();
        for c in self.core.connections() {
            c.set_weight(fresh);
        }
        self.recompute();
    }

    async fn empty(&self) {
        self.core.empty().await;
        let mut state = self.lock_state();
        state.index = -1;
        state.current_weight = 0;
        state.max_weight = 0;
        state.gcd = 0;
    }

    /// No-op for an already-alive connection or a single-node pool;
    /// otherwise restores the fresh weight.
    fn mark_alive(&self, conn: &Arc<Connection>) {
        if self.core.connections().len() == 1 || conn.status() == NodeStatus::Alive {
            return;
        }
        conn.mark_alive_state();
        conn.set_weight(self.fresh_weight());
        self.recompute();
    }

    /// Decay the weight by `round(log2(weight) ^ dead_count)`, floored at 1.
    fn mark_dead(&self, conn: &Arc<Connection>) {
        let dead_count = conn.mark_dead_state();
        let weight = conn.weight();
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let decrease = f64::from(weight).log2().powi(dead_count as i32).round() as i64;
        let next = (i64::from(weight) - decrease).max(1);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        conn.set_weight(next as u32);
        self.recompute();
    }

    /// Classic weighted round-robin over the rotating cursor. The external
    /// selector does not apply here; the rotation is the policy. Bails after
    /// one full scan.
    async fn get_connection(&self, options: &SelectionOptions) -> Option<Arc<Connection>> {
        let connections = self.core.connections();
        if connections.is_empty() {
            return None;
        }
        #[allow(clippy::cast_possible_wrap)]
        let size = connections.len() as i64;
        let mut state = self.lock_state();
        if state.max_weight == 0 {
            return None;
        }
        for _ in 0..size {
            state.index = (state.index + 1) % size;
            if state.index == 0 {
                state.current_weight -= i64::from(state.gcd);
                if state.current_weight <= 0 {
                    state.current_weight = i64::from(state.max_weight);
                }
            }
            #[allow(clippy::cast_sign_loss)]
            let conn = &connections[state.index as usize];
            if i64::from(conn.weight()) >= state.current_weight && (options.filter)(conn) {
                return Some(Arc::clone(conn));
            }
        }
        None
    }

    fn connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections()
    }

    fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.core.diagnostics
    }
}
