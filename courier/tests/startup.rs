#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use axum::{
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use courier::Courier;
use courier_api::{TENANT_HEADER, router};
use courier_dispatch::Route;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tower::ServiceExt;

fn config(relay_port: u16, upstream_port: u16) -> String {
    format!(
        r#"Courier (
            relay: (
                socket: "127.0.0.1:{relay_port}",
                credentials: (username: "engine", password: "pw"),
            ),
            upstream: (
                host: "127.0.0.1",
                port: {upstream_port},
                security: Plain,
                timeout_secs: 2,
            ),
            operator_mailbox: "operator@acme.com",
            tenants: [(id: "acme", from: "news@acme.com")],
            resolver: Static(["good.com"]),
            dispatch: (route: Submission),
            api: (listen_address: "127.0.0.1:0"),
        )"#
    )
}

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn relay_port_conflict_degrades_to_direct() {
    let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = squatter.local_addr().unwrap().port();

    let services = Courier::from_ron(&config(taken, closed_port().await))
        .unwrap()
        .build()
        .await
        .unwrap();

    assert!(services.relay.is_none());
    assert!(services.api.is_some());
    assert_eq!(services.route, Route::Direct);

    // The API still answers; the attempt is logged and fails upstream.
    let app = router(services.state, Duration::from_secs(10));
    let response = app
        .oneshot(
            Request::post("/send")
                .header(TENANT_HEADER, "acme")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "to": "a@good.com", "subject": "Hi", "text": "Hello" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
            .unwrap();
    assert_eq!(body["results"][0]["status"], json!("failed"));
    assert!(body["results"][0]["logId"].is_string());
}

#[tokio::test]
async fn submission_route_when_relay_binds() {
    let services = Courier::from_ron(&config(0, closed_port().await))
        .unwrap()
        .build()
        .await
        .unwrap();

    assert!(services.relay.is_some());
    assert_eq!(services.route, Route::Submission);
}

#[tokio::test]
async fn relay_can_be_left_out() {
    let services = Courier::from_ron(
        r#"Courier (
            tenants: [(id: "acme", from: "news@acme.com")],
            resolver: Static([]),
            dispatch: (route: Submission),
            api: (enabled: false),
        )"#,
    )
    .unwrap()
    .build()
    .await
    .unwrap();

    assert!(services.relay.is_none());
    assert!(services.api.is_none());
    assert_eq!(services.route, Route::Direct);
}

#[tokio::test]
async fn exposed_relay_socket_is_refused() {
    let config = config(0, closed_port().await)
        .replace(r#"socket: "127.0.0.1:0""#, r#"socket: "0.0.0.0:0""#);
    assert!(config.contains("0.0.0.0"));

    let services = Courier::from_ron(&config).unwrap().build().await.unwrap();

    assert!(services.relay.is_none());
    assert_eq!(services.route, Route::Direct);
}
