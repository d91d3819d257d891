//! HTTP surface tests: axum on port 0, exercised with reqwest.

use std::sync::Arc;
use std::time::Duration;

use relay_gateway::dispatch::{self, MAX_BODY_BYTES};
use relay_gateway::transport::http::log_router;
use relay_gateway::transport::{HttpClient, HttpLogTransport};
use relay_gateway::{EventMessage, LogTransport};
use serde_json::{json, Value};

use crate::support::{init, MemorySink, Rig};

async fn start(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn start_dispatcher(rig: Rig) -> String {
    start(dispatch::router(Arc::new(rig.dispatcher))).await
}

#[tokio::test]
async fn root_says_hit_the_broker() {
    let base = start_dispatcher(Rig::new(202, json!({}))).await;

    let resp = reqwest::Client::new().post(&base).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": false, "message": "Hit the broker"}));
}

#[tokio::test]
async fn ping() {
    let base = start_dispatcher(Rig::new(202, json!({}))).await;

    let resp = reqwest::get(format!("{base}/ping")).await.unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn handle_dispatches_and_maps_status() {
    init();
    let base = start_dispatcher(Rig::new(
        202,
        json!({"error": false, "data": {"id": 1, "email": "me@me.me"}}),
    ))
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/handle"))
        .json(&json!({"action": "auth", "auth": {"email": "me@me.me", "password": "secret"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Successfully authenticated");
    assert_eq!(body["data"]["id"], 1);

    let resp = client
        .post(format!("{base}/handle"))
        .json(&json!({"action": "bogus"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"error": true, "message": "unknown action"}));
}

#[tokio::test]
async fn oversized_body_gets_the_json_envelope() {
    let base = start_dispatcher(Rig::new(202, json!({}))).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/handle"))
        .body(vec![b' '; MAX_BODY_BYTES + 1])
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 413);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], true);
}

#[tokio::test]
async fn http_log_transport_against_log_router() {
    let sink = Arc::new(MemorySink::default());
    let base = start(log_router(sink.clone())).await;

    let transport = HttpLogTransport::new(
        HttpClient::new(Duration::from_secs(1)).unwrap(),
        format!("{base}/log"),
    );
    let reply = transport.send(&EventMessage::new("log", "x")).await.unwrap();

    assert_eq!(reply, "logged");
    assert_eq!(sink.entries(), [EventMessage::new("log", "x")]);
}
