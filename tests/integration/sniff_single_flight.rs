//! Sniffing: single-flight under a failure wave, trigger sources, and pool
//! reconciliation from a sniff response.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use shoal::pool::ConnectionPool;
use shoal::transport::SniffAction;
use shoal::{
    ClusterPool, Error, EventKind, NodeSpec, PoolOptions, RequestOptions, RequestParams,
    ResurrectStrategy, SniffReason, Transport,
};
use shoal_test_utils::{MockFleet, MockReply};
use url::Url;

fn broken_pool(fleet: &Arc<MockFleet>, nodes: usize) -> Arc<ClusterPool> {
    for i in 1..=nodes {
        fleet
            .wire(&format!("node-{i}:9200"))
            .fail_always("connection reset by peer");
    }
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()))
        .with_resurrect_strategy(ResurrectStrategy::None);
    for i in 1..=nodes {
        pool.add_connection(NodeSpec::new(
            Url::parse(&format!("http://node-{i}:9200")).unwrap(),
        ))
        .unwrap();
    }
    Arc::new(pool)
}

/// A slow refresh action, so a whole failure wave lands while one refresh is
/// in flight.
struct SlowSniffer {
    invocations: AtomicUsize,
    hosts: Vec<String>,
}

#[async_trait]
impl SniffAction for SlowSniffer {
    async fn sniff(&self) -> Result<Vec<NodeSpec>, Error> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(self
            .hosts
            .iter()
            .map(|h| NodeSpec::new(Url::parse(h).unwrap()))
            .collect())
    }
}

#[tokio::test]
async fn failure_wave_triggers_exactly_one_sniff() {
    let fleet = MockFleet::new();
    let pool = broken_pool(&fleet, 2);
    let sniffer = Arc::new(SlowSniffer {
        invocations: AtomicUsize::new(0),
        hosts: vec![
            "http://node-10:9200".to_owned(),
            "http://node-11:9200".to_owned(),
            "http://node-12:9200".to_owned(),
        ],
    });
    let transport = Transport::builder(pool)
        .sniff_on_connection_fault(true)
        .max_retries(0)
        .sniffer(Arc::clone(&sniffer) as Arc<dyn SniffAction>)
        .build()
        .unwrap();

    let sniff_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&sniff_events);
    transport.diagnostics().on(EventKind::Sniff, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // A wave of concurrent requests, all hitting broken nodes.
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let transport = transport.clone();
        tasks.push(tokio::spawn(async move {
            transport
                .request(RequestParams::new("GET", "/"), RequestOptions::default())
                .await
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_err());
    }

    // Let the in-flight refresh finish.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(sniffer.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(sniff_events.load(Ordering::SeqCst), 1);

    // The pool was reconciled against the refreshed membership.
    let ids: Vec<String> = transport
        .pool()
        .connections()
        .iter()
        .map(|c| c.id())
        .collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.iter().all(|id| id.contains("node-1")));
}

#[tokio::test]
async fn next_wave_can_sniff_again() {
    let fleet = MockFleet::new();
    let pool = broken_pool(&fleet, 1);
    let sniffer = Arc::new(SlowSniffer {
        invocations: AtomicUsize::new(0),
        hosts: vec!["http://node-1:9200".to_owned()],
    });
    let transport = Transport::builder(pool)
        .sniff_on_connection_fault(true)
        .max_retries(0)
        .sniffer(Arc::clone(&sniffer) as Arc<dyn SniffAction>)
        .build()
        .unwrap();

    for _ in 0..2 {
        let _ = transport
            .request(RequestParams::new("GET", "/"), RequestOptions::default())
            .await;
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
    assert_eq!(sniffer.invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn sniff_on_start_fires_at_construction() {
    let fleet = MockFleet::new();
    // node-1 serves the topology endpoint.
    fleet.wire("node-1:9200").push_reply(MockReply::json(
        200,
        &json!({
            "nodes": {
                "sniffed-a": {"http": {"publish_address": "node-2:9200"}, "roles": ["data"]},
                "sniffed-b": {"http": {"publish_address": "node-3:9200"}, "roles": ["data"]},
            },
        }),
    ));
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()));
    pool.add_connection(NodeSpec::new(Url::parse("http://node-1:9200").unwrap()))
        .unwrap();

    let transport = Transport::builder(Arc::new(pool))
        .sniff_on_start(true)
        .build()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut ids: Vec<String> = transport
        .pool()
        .connections()
        .iter()
        .map(|c| c.id())
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["sniffed-a".to_owned(), "sniffed-b".to_owned()]);

    // The sniff request went to the topology endpoint.
    let calls = fleet.wire("node-1:9200").calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].url.path().contains("_nodes"));
}

#[tokio::test]
async fn interval_sniff_triggers_on_the_request_path() {
    let fleet = MockFleet::new();
    let wire = fleet.wire("node-1:9200");
    wire.set_default(shoal_test_utils::MockExchange::Reply(MockReply::json(
        200,
        &json!({
            "nodes": {
                "only": {"http": {"publish_address": "node-1:9200"}, "roles": ["data"]},
            },
        }),
    )));
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()));
    pool.add_connection(NodeSpec::new(Url::parse("http://node-1:9200").unwrap()))
        .unwrap();

    let transport = Transport::builder(Arc::new(pool))
        .sniff_interval(Some(Duration::from_millis(50)))
        .build()
        .unwrap();

    let sniff_events = Arc::new(AtomicUsize::new(0));
    let reasons: Arc<std::sync::Mutex<Vec<SniffReason>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let counter = Arc::clone(&sniff_events);
    let seen = Arc::clone(&reasons);
    transport
        .diagnostics()
        .on(EventKind::Sniff, move |_, payload| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(shoal::EventPayload::Sniff(event)) = payload {
                seen.lock().unwrap().push(event.reason);
            }
        });

    // First request: the interval clock has not elapsed yet.
    transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    // Second request: past the deadline, so a refresh fires.
    transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(sniff_events.load(Ordering::SeqCst) >= 1);
    assert!(reasons
        .lock()
        .unwrap()
        .contains(&SniffReason::SniffInterval));
}
