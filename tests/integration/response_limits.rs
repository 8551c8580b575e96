//! Response size caps enforced over a real socket.

use std::sync::Arc;

use serde_json::json;
use shoal::connection::{reqwest_wire_builder, WireConfig};
use shoal::pool::{url_to_host, ConnectionPool};
use shoal::{ClusterPool, Error, PoolOptions, RequestOptions, RequestParams, Transport};
use shoal_test_utils::{HttpResponse, MockNode};

async fn transport_for(node: &MockNode) -> Transport {
    let pool = ClusterPool::new(PoolOptions::new(reqwest_wire_builder(WireConfig::default())));
    pool.add_connection(url_to_host(&node.url()).unwrap()).unwrap();
    Transport::builder(Arc::new(pool))
        .max_retries(0)
        .build()
        .unwrap()
}

#[tokio::test]
async fn announced_length_over_cap_aborts_the_request() {
    let node = MockNode::start(|_request| HttpResponse::text(200, &"x".repeat(4096)))
        .await
        .unwrap();
    let transport = transport_for(&node).await;

    let err = transport
        .request(
            RequestParams::new("GET", "/big"),
            RequestOptions {
                max_response_size: Some(1024),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RequestAborted { .. }), "{err}");
    assert!(err.to_string().contains("exceeds"), "{err}");
}

#[tokio::test]
async fn compressed_cap_applies_to_raw_bytes() {
    let node = MockNode::start(|_request| {
        HttpResponse::gzip_json(200, &json!({"filler": "y".repeat(8192)}))
    })
    .await
    .unwrap();
    let transport = transport_for(&node).await;

    let err = transport
        .request(
            RequestParams::new("GET", "/compressed"),
            RequestOptions {
                max_compressed_response_size: Some(16),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RequestAborted { .. }), "{err}");
}

#[tokio::test]
async fn bodies_within_the_cap_pass() {
    let node = MockNode::start(|_request| HttpResponse::json(200, &json!({"small": true})))
        .await
        .unwrap();
    let transport = transport_for(&node).await;

    let response = transport
        .request(
            RequestParams::new("GET", "/small"),
            RequestOptions {
                max_response_size: Some(1024),
                max_compressed_response_size: Some(1024),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.body.as_json(), Some(&json!({"small": true})));
}
