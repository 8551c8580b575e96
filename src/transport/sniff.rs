//! Topology refresh ("sniffing") coordination.
//!
//! Three triggers feed one single-flight action: construction
//! (sniff-on-start), a per-request interval check, and connection faults.
//! Triggers observed while a refresh is in flight are dropped; every
//! completed refresh reschedules the interval clock and publishes a `sniff`
//! diagnostic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Inner, Transport};
use crate::connection::{ConnectionBody, ConnectionRequest, ConnectionRequestOptions, NodeSpec};
use crate::diagnostics::{EventKind, EventPayload, SniffEvent};
use crate::errors::Error;
use crate::meta::{HeaderMap, SniffReason};
use crate::pool::nodes_to_host;

/// Replaces the stock refresh action (HTTP call + publish-address parsing)
/// while keeping the coordinator's single-flight and scheduling behavior.
#[async_trait]
pub trait SniffAction: Send + Sync {
    async fn sniff(&self) -> Result<Vec<NodeSpec>, Error>;
}

pub(super) struct SniffState {
    /// True iff a positive interval is configured.
    pub(super) enabled: bool,
    pub(super) interval: Option<Duration>,
    pub(super) on_fault: bool,
    pub(super) endpoint: String,
    pub(super) on_start: bool,
    pub(super) is_sniffing: AtomicBool,
    pub(super) next_at: Mutex<Instant>,
}

impl SniffState {
    pub(super) fn new(
        interval: Option<Duration>,
        on_fault: bool,
        on_start: bool,
        endpoint: String,
    ) -> Self {
        let next_at = Instant::now() + interval.unwrap_or(Duration::ZERO);
        SniffState {
            enabled: interval.is_some(),
            interval,
            on_fault,
            endpoint,
            on_start,
            is_sniffing: AtomicBool::new(false),
            next_at: Mutex::new(next_at),
        }
    }
}

impl Transport {
    /// Request a topology refresh. Returns immediately; the refresh runs in a
    /// background task. Dropped when one is already in flight.
    pub fn sniff(&self, reason: SniffReason) {
        trigger(&self.inner, reason);
    }

    /// Interval trigger, checked on the hot path before node selection.
    pub(super) fn maybe_interval_sniff(&self) {
        let sniff = &self.inner.sniff;
        if !sniff.enabled {
            return;
        }
        let due = {
            let next_at = sniff.next_at.lock().expect("sniff clock lock poisoned");
            Instant::now() >= *next_at
        };
        if due {
            trigger(&self.inner, SniffReason::SniffInterval);
        }
    }

    pub(super) fn maybe_fault_sniff(&self) {
        if self.inner.sniff.on_fault {
            trigger(&self.inner, SniffReason::SniffOnConnectionFault);
        }
    }
}

pub(super) fn trigger(inner: &Arc<Inner>, reason: SniffReason) {
    if inner
        .sniff
        .is_sniffing
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Single-flight: a refresh is already running.
        return;
    }
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        run(inner, reason).await;
    });
}

async fn run(inner: Arc<Inner>, reason: SniffReason) {
    let result = refresh(&inner).await;

    if let Some(interval) = inner.sniff.interval {
        let mut next_at = inner.sniff.next_at.lock().expect("sniff clock lock poisoned");
        *next_at = Instant::now() + interval;
    }
    inner.sniff.is_sniffing.store(false, Ordering::Release);

    match result {
        Ok(hosts) => {
            tracing::debug!(reason = reason.as_str(), nodes = hosts.len(), "topology refreshed");
            let event = SniffEvent { hosts, reason };
            inner
                .diagnostics
                .emit(EventKind::Sniff, None, Some(&EventPayload::Sniff(&event)));
        }
        Err(error) => {
            tracing::warn!(reason = reason.as_str(), %error, "topology refresh failed");
            let event = SniffEvent {
                hosts: Vec::new(),
                reason,
            };
            inner
                .diagnostics
                .emit(EventKind::Sniff, Some(&error), Some(&EventPayload::Sniff(&event)));
        }
    }
}

/// Run the refresh action and reconcile the pool. Returns the discovered
/// host URLs.
async fn refresh(inner: &Arc<Inner>) -> Result<Vec<String>, Error> {
    let specs = match &inner.sniffer {
        Some(action) => action.sniff().await?,
        None => stock_sniff(inner).await?,
    };
    let hosts: Vec<String> = specs.iter().map(|s| s.url.to_string()).collect();
    inner.pool.update(specs);
    Ok(hosts)
}

/// The stock action: ask one node for the cluster membership.
async fn stock_sniff(inner: &Arc<Inner>) -> Result<Vec<NodeSpec>, Error> {
    let conn = inner
        .pool
        .get_connection(&inner.selection)
        .await
        .ok_or(Error::NoLivingConnections { meta: None })?;

    let mut headers = HeaderMap::new();
    headers.insert("accept".to_owned(), "application/json".to_owned());
    let response = conn
        .request(
            ConnectionRequest {
                method: "GET".to_owned(),
                path: inner.sniff.endpoint.clone(),
                querystring: String::new(),
                headers,
                body: None,
            },
            ConnectionRequestOptions {
                timeout: inner.request_timeout,
                max_response_size: Some(inner.max_response_size),
                max_compressed_response_size: Some(inner.max_compressed_response_size),
                ..Default::default()
            },
        )
        .await?;

    if response.status >= 400 {
        return Err(Error::Connection {
            message: format!(
                "topology endpoint '{}' answered with status {}",
                inner.sniff.endpoint, response.status
            ),
            meta: None,
        });
    }
    let text = match response.body {
        ConnectionBody::Text(text) => text,
        ConnectionBody::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        ConnectionBody::Stream(_) => {
            return Err(Error::Connection {
                message: "topology endpoint returned an unexpected stream".to_owned(),
                meta: None,
            });
        }
    };
    let body = inner.codec.deserialize(&text)?;
    Ok(nodes_to_host(&body, conn.url().scheme()))
}
