//! Lifecycle event fanout.
//!
//! The bus is instance-scoped (one per transport, shared with its pool) and
//! delivery is synchronous in the publishing task, in registration order.
//! Listeners receive `(error, payload)` where exactly the failing side is
//! populated on failure paths.
//!
//! Events are also mirrored to `tracing` at debug level unless the
//! `SHOAL_OBSERVABILITY` environment variable is set to a falsy value.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::errors::Error;
use crate::meta::{ConnectionInfo, RequestMeta, Response, SniffReason};
use crate::pool::ResurrectStrategy;

/// Environment toggle for the tracing mirror.
pub const OBSERVABILITY_ENV: &str = "SHOAL_OBSERVABILITY";

// ---------------------------------------------------------------------------
// Event kinds and payloads
// ---------------------------------------------------------------------------

/// The closed set of diagnostic event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Serialization,
    Request,
    Response,
    Deserialization,
    Sniff,
    Resurrect,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Serialization => "serialization",
            EventKind::Request => "request",
            EventKind::Response => "response",
            EventKind::Deserialization => "deserialization",
            EventKind::Sniff => "sniff",
            EventKind::Resurrect => "resurrect",
        }
    }

    /// Resolve an event name; unknown names are a configuration error.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "serialization" => Ok(EventKind::Serialization),
            "request" => Ok(EventKind::Request),
            "response" => Ok(EventKind::Response),
            "deserialization" => Ok(EventKind::Deserialization),
            "sniff" => Ok(EventKind::Sniff),
            "resurrect" => Ok(EventKind::Resurrect),
            other => Err(Error::Configuration(format!(
                "unknown diagnostic event '{other}'"
            ))),
        }
    }
}

/// Payload of a completed topology refresh.
#[derive(Debug, Clone)]
pub struct SniffEvent {
    /// URLs of the hosts the refresh discovered.
    pub hosts: Vec<String>,
    pub reason: SniffReason,
}

/// Payload of a resurrection attempt on a dead connection.
#[derive(Debug, Clone)]
pub struct ResurrectEvent {
    pub strategy: ResurrectStrategy,
    pub is_alive: bool,
    pub connection: ConnectionInfo,
}

/// What a listener receives alongside the optional error.
#[derive(Debug)]
pub enum EventPayload<'a> {
    /// Request-side events (`serialization`, `request`, `deserialization`),
    /// and failure-path `response` events where no response exists.
    Meta(&'a RequestMeta),
    /// Successful `response` events.
    Response(&'a Response),
    Sniff(&'a SniffEvent),
    Resurrect(&'a ResurrectEvent),
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

type Listener = Arc<dyn Fn(Option<&Error>, Option<&EventPayload<'_>>) + Send + Sync>;

/// Handle returned by `on`, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

pub struct Diagnostics {
    listeners: Mutex<Vec<(EventKind, ListenerId, Listener)>>,
    next_id: AtomicU64,
    mirror: bool,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.listeners.lock().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("Diagnostics")
            .field("listeners", &count)
            .field("mirror", &self.mirror)
            .finish()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            mirror: mirror_enabled(),
        }
    }

    /// Register a listener for one event kind. Listeners run synchronously
    /// in the publishing task, in registration order.
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(Option<&Error>, Option<&EventPayload<'_>>) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().expect("diagnostics lock poisoned");
        listeners.push((kind, id, Arc::new(listener)));
        id
    }

    /// Register by event name; fails for names outside the closed set.
    pub fn on_named(
        &self,
        name: &str,
        listener: impl Fn(Option<&Error>, Option<&EventPayload<'_>>) + Send + Sync + 'static,
    ) -> Result<ListenerId, Error> {
        Ok(self.on(EventKind::from_name(name)?, listener))
    }

    /// Deregister a listener. Returns whether it was present.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().expect("diagnostics lock poisoned");
        let before = listeners.len();
        listeners.retain(|(_, lid, _)| *lid != id);
        listeners.len() != before
    }

    pub(crate) fn emit(
        &self,
        kind: EventKind,
        error: Option<&Error>,
        payload: Option<&EventPayload<'_>>,
    ) {
        if self.mirror {
            match error {
                Some(err) => {
                    tracing::debug!(event = kind.name(), error = %err, "transport diagnostic");
                }
                None => tracing::debug!(event = kind.name(), "transport diagnostic"),
            }
        }
        // Snapshot under the lock, invoke outside it, so listeners can
        // register/deregister (even re-entrantly) without deadlocking.
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("diagnostics lock poisoned");
            listeners
                .iter()
                .filter(|(k, _, _)| *k == kind)
                .map(|(_, _, l)| Arc::clone(l))
                .collect()
        };
        for listener in snapshot {
            listener(error, payload);
        }
    }
}

fn mirror_enabled() -> bool {
    match std::env::var(OBSERVABILITY_ENV) {
        Ok(value) => !matches!(
            value.to_ascii_lowercase().as_str(),
            "0" | "false" | "off" | "no"
        ),
        Err(_) => true,
    }
}
