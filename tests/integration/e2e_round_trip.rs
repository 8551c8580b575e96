//! End-to-end round trip over a real socket: transport -> reqwest engine ->
//! mock HTTP node.

use std::sync::Arc;

use serde_json::json;
use shoal::connection::{reqwest_wire_builder, WireConfig};
use shoal::pool::{url_to_host, ConnectionPool};
use shoal::{
    ClusterPool, Credentials, PoolOptions, RequestOptions, RequestParams, Transport,
};
use shoal_test_utils::{HttpResponse, MockNode};

async fn transport_for(node: &MockNode) -> Transport {
    let pool = ClusterPool::new(PoolOptions::new(reqwest_wire_builder(WireConfig::default())));
    pool.add_connection(url_to_host(&node.url()).unwrap()).unwrap();
    Transport::builder(Arc::new(pool)).build().unwrap()
}

#[tokio::test]
async fn get_hello_round_trips_with_headers() {
    let node = MockNode::start(|request| {
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/hello");
        let custom = request
            .headers
            .get("x-custom-test")
            .cloned()
            .unwrap_or_default();
        HttpResponse::text(200, "ok").with_header("x-custom-test", &custom)
    })
    .await
    .unwrap();
    let transport = transport_for(&node).await;

    let mut headers = shoal::HeaderMap::new();
    headers.insert("x-custom-test".to_owned(), "true".to_owned());
    let response = transport
        .request(
            RequestParams::new("GET", "/hello"),
            RequestOptions {
                headers: Some(headers),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body.as_text(), Some("ok"));
    assert_eq!(
        response.headers.get("x-custom-test").map(String::as_str),
        Some("true")
    );
    assert_eq!(
        response.headers.get("connection").map(String::as_str),
        Some("keep-alive")
    );
}

#[tokio::test]
async fn json_response_decodes_over_the_socket() {
    let node = MockNode::start(|_request| {
        HttpResponse::json(200, &json!({"cluster_name": "fleet", "status": "green"}))
    })
    .await
    .unwrap();
    let transport = transport_for(&node).await;

    let response = transport
        .request(RequestParams::new("GET", "/_cluster/health"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(
        response.body.as_json(),
        Some(&json!({"cluster_name": "fleet", "status": "green"}))
    );
}

#[tokio::test]
async fn basic_auth_reaches_the_server() {
    let node = MockNode::start(|request| {
        let auth = request
            .headers
            .get("authorization")
            .cloned()
            .unwrap_or_default();
        HttpResponse::json(200, &json!({"authorization": auth}))
    })
    .await
    .unwrap();

    let pool = ClusterPool::new(
        PoolOptions::new(reqwest_wire_builder(WireConfig::default())).with_auth(
            Credentials::Basic {
                username: "elastic".to_owned(),
                password: "changeme".to_owned(),
            },
        ),
    );
    pool.add_connection(url_to_host(&node.url()).unwrap()).unwrap();
    let transport = Transport::builder(Arc::new(pool)).build().unwrap();

    let response = transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap();
    let body = response.body.as_json().unwrap();
    assert_eq!(
        body["authorization"],
        format!("Basic {}", base64::encode("elastic:changeme"))
    );
}

#[tokio::test]
async fn gzip_response_decompresses_over_the_socket() {
    let node = MockNode::start(|_request| {
        HttpResponse::gzip_json(200, &json!({"compressed": true}))
    })
    .await
    .unwrap();
    let transport = transport_for(&node).await;

    let response = transport
        .request(RequestParams::new("GET", "/"), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.body.as_json(), Some(&json!({"compressed": true})));
}
