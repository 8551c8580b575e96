//! Retry and health transitions against a real socket: a node that hiccups
//! with 503 once must be marked dead, retried, and restored on success.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use shoal::connection::{reqwest_wire_builder, NodeStatus, WireConfig};
use shoal::pool::{url_to_host, ConnectionPool};
use shoal::{ClusterPool, PoolOptions, RequestOptions, RequestParams, Transport};
use shoal_test_utils::{HttpResponse, MockNode};

#[tokio::test]
async fn first_503_retries_to_success() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let node = MockNode::start(move |_request| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            HttpResponse::json(503, &json!({"error": "unavailable"}))
        } else {
            HttpResponse::json(200, &json!({"hello": "world"}))
        }
    })
    .await
    .unwrap();

    let pool = ClusterPool::new(PoolOptions::new(reqwest_wire_builder(WireConfig::default())));
    pool.add_connection(url_to_host(&node.url()).unwrap()).unwrap();
    let transport = Transport::builder(Arc::new(pool)).build().unwrap();

    let response = transport
        .request(RequestParams::new("GET", "/doc"), RequestOptions::default())
        .await
        .unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.meta.attempts, 1);
    assert_eq!(response.body.as_json(), Some(&json!({"hello": "world"})));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    let conns = transport.pool().connections();
    let conn = &conns[0];
    assert_eq!(conn.status(), NodeStatus::Alive);
    assert_eq!(conn.dead_count(), 0);
}

#[tokio::test]
async fn unreachable_node_surfaces_connection_error() {
    // Bind and immediately drop a listener to get a port nobody serves.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pool = ClusterPool::new(PoolOptions::new(reqwest_wire_builder(WireConfig::default())));
    pool.add_connection(url_to_host(&format!("http://{addr}")).unwrap())
        .unwrap();
    let transport = Transport::builder(Arc::new(pool))
        .max_retries(1)
        .build()
        .unwrap();

    let err = transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, shoal::Error::Connection { .. }), "{err}");
    // The failing node ends up dead.
    let conns = transport.pool().connections();
    let conn = &conns[0];
    assert_eq!(conn.status(), NodeStatus::Dead);
    assert!(conn.dead_count() >= 1);
}

#[tokio::test]
async fn post_round_trips_body_over_the_socket() {
    let node = MockNode::start(|request| {
        let received: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        HttpResponse::json(201, &json!({"echo": received}))
    })
    .await
    .unwrap();

    let pool = ClusterPool::new(PoolOptions::new(reqwest_wire_builder(WireConfig::default())));
    pool.add_connection(url_to_host(&node.url()).unwrap()).unwrap();
    let transport = Transport::builder(Arc::new(pool)).build().unwrap();

    let response = transport
        .request(
            RequestParams::new("POST", "/doc").with_body(shoal::Body::Json(json!({"n": 7}))),
            RequestOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.status_code, 201);
    assert_eq!(response.body.as_json(), Some(&json!({"echo": {"n": 7}})));
}
