//! Backoff gating: with a pool of 3 and 5 retries, the first three attempts
//! run back-to-back (every node gets a chance first); later attempts sleep.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use shoal::pool::ConnectionPool;
use shoal::{
    ClusterPool, NodeSpec, PoolOptions, RequestOptions, RequestParams, ResurrectStrategy,
    Transport,
};
use shoal_test_utils::MockFleet;
use url::Url;

#[tokio::test(start_paused = true)]
async fn backoff_applies_only_after_every_node_was_tried() {
    let fleet = MockFleet::new();
    for i in 1..=3 {
        fleet.wire(&format!("node-{i}:9200")).fail_always("connection refused");
    }
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()))
        .with_resurrect_strategy(ResurrectStrategy::None);
    for i in 1..=3 {
        pool.add_connection(NodeSpec::new(
            Url::parse(&format!("http://node-{i}:9200")).unwrap(),
        ))
        .unwrap();
    }

    let backoff_calls: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&backoff_calls);
    let transport = Transport::builder(Arc::new(pool))
        .max_retries(5)
        .retry_backoff(move |_min, max, attempt| {
            recorded.lock().unwrap().push(attempt);
            // Deterministic equal-jitter floor: half the capped exponential.
            f64::from(2_u32.pow(attempt).min(max)) / 2.0
        })
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, shoal::Error::Connection { .. }), "{err}");
    // 6 attempts total, spread across the 3 nodes.
    assert_eq!(fleet.total_calls(), 6);
    // The backoff function runs only for attempts 3, 4, and 5.
    assert_eq!(*backoff_calls.lock().unwrap(), vec![3, 4, 5]);
    // Floors: min(2^3,30)/2 + min(2^4,30)/2 + min(2^5,30)/2 = 4 + 8 + 15.
    assert!(elapsed >= Duration::from_secs(27), "slept only {elapsed:?}");
    assert!(elapsed < Duration::from_secs(28), "slept {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn attempts_below_pool_size_never_sleep() {
    let fleet = MockFleet::new();
    for i in 1..=3 {
        fleet.wire(&format!("node-{i}:9200")).fail_always("connection refused");
    }
    let pool = ClusterPool::new(PoolOptions::new(fleet.builder()))
        .with_resurrect_strategy(ResurrectStrategy::None);
    for i in 1..=3 {
        pool.add_connection(NodeSpec::new(
            Url::parse(&format!("http://node-{i}:9200")).unwrap(),
        ))
        .unwrap();
    }
    let transport = Transport::builder(Arc::new(pool))
        .max_retries(2)
        .retry_backoff(|_, _, _| panic!("backoff must not run below pool size"))
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let _ = transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(fleet.total_calls(), 3);
}
