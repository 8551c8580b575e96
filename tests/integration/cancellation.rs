//! Cancellation semantics: caller aborts vs internal deadlines, stickiness,
//! and the deadline winning a tie.

use std::sync::Arc;
use std::time::Duration;

use shoal::pool::ConnectionPool;
use shoal::{
    ClusterPool, Error, NodeSpec, PoolOptions, RequestOptions, RequestParams, ResurrectStrategy,
    Transport,
};
use shoal_test_utils::MockFleet;
use tokio_util::sync::CancellationToken;
use url::Url;

fn hanging_transport(fleet: &Arc<MockFleet>) -> Transport {
    fleet.wire("node-1:9200").push_hang();
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()))
        .with_resurrect_strategy(ResurrectStrategy::None);
    pool.add_connection(NodeSpec::new(Url::parse("http://node-1:9200").unwrap()))
        .unwrap();
    Transport::builder(Arc::new(pool))
        .max_retries(3)
        .build()
        .unwrap()
}

#[tokio::test]
async fn mid_flight_abort_surfaces_aborted_and_stops_retrying() {
    let fleet = MockFleet::new();
    let transport = hanging_transport(&fleet);

    let signal = CancellationToken::new();
    let canceller = {
        let signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            signal.cancel();
        })
    };

    let err = transport
        .request(
            RequestParams::new("GET", "/slow"),
            RequestOptions {
                signal: Some(signal),
                timeout: Some(Duration::from_secs(30)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, Error::RequestAborted { .. }), "{err}");
    assert!(err.meta().unwrap().aborted);
    // Aborts are sticky: one attempt, despite max_retries.
    assert_eq!(fleet.wire("node-1:9200").call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn internal_deadline_wins_over_a_racing_abort() {
    let fleet = MockFleet::new();
    fleet.wire("node-1:9200").push_hang();
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()))
        .with_resurrect_strategy(ResurrectStrategy::None);
    pool.add_connection(NodeSpec::new(Url::parse("http://node-1:9200").unwrap()))
        .unwrap();
    let transport = Transport::builder(Arc::new(pool)).build().unwrap();

    // Both fire at the same paused-clock instant; the deadline must win.
    let signal = CancellationToken::new();
    let canceller = {
        let signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            signal.cancel();
        })
    };

    let err = transport
        .request(
            RequestParams::new("GET", "/slow"),
            RequestOptions {
                signal: Some(signal),
                timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    canceller.await.unwrap();
    assert!(matches!(err, Error::Timeout { .. }), "{err}");
}

#[tokio::test]
async fn already_cancelled_signal_never_reaches_the_wire() {
    let fleet = MockFleet::new();
    let transport = hanging_transport(&fleet);

    let signal = CancellationToken::new();
    signal.cancel();
    let err = transport
        .request(
            RequestParams::new("GET", "/"),
            RequestOptions {
                signal: Some(signal),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RequestAborted { .. }), "{err}");
    assert_eq!(fleet.total_calls(), 0);
}
