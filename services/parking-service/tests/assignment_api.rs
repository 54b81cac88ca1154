//! HTTP surface of parking-service.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::Harness;
use tower::ServiceExt;

async fn call(app: axum::Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).expect("envelope body"))
}

const ASSIGN: &str = "/parking/parkings/assign?userId=7&parkId=42&carNumber=ABC-123&parkNum=B-42";

#[tokio::test]
async fn assign_returns_the_new_assignment() {
    let h = Harness::new().with_owner(7);

    let (status, body) = call(h.app(), Method::POST, ASSIGN).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    assert_eq!(body["data"]["parkId"], 42);
    assert_eq!(body["data"]["status"], "active");
    assert!(body["data"]["ownerParkingId"].is_number());
}

#[tokio::test]
async fn second_assignment_for_owner_conflicts() {
    let h = Harness::new().with_owner(7);
    call(h.app(), Method::POST, ASSIGN).await;

    let (status, body) = call(
        h.app(),
        Method::POST,
        "/parking/parkings/assign?userId=7&parkId=43&carNumber=ABC-123",
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);
}

#[tokio::test]
async fn unknown_owner_is_404() {
    let h = Harness::new();

    let (status, _) = call(h.app(), Method::POST, ASSIGN).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn user_service_down_is_503() {
    let h = Harness::new().with_owner(7);
    h.users.set_down(true);

    let (status, body) = call(h.app(), Method::POST, ASSIGN).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], 503);
}

#[tokio::test]
async fn missing_parameters_are_400() {
    let h = Harness::new().with_owner(7);

    let (status, _) = call(h.app(), Method::POST, "/parking/parkings/assign?userId=7").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn return_requires_exactly_one_target() {
    let h = Harness::new().with_owner(7);

    let (both, _) = call(h.app(), Method::POST, "/parking/parkings/return?userId=7&parkId=42").await;
    let (neither, _) = call(h.app(), Method::POST, "/parking/parkings/return").await;

    assert_eq!(both, StatusCode::BAD_REQUEST);
    assert_eq!(neither, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn owner_record_round_trip() {
    let h = Harness::new().with_owner(7);

    let (before, _) = call(h.app(), Method::GET, "/parking/owner/record?userId=7").await;
    assert_eq!(before, StatusCode::NOT_FOUND);

    call(h.app(), Method::POST, ASSIGN).await;
    let (status, body) = call(h.app(), Method::GET, "/parking/owner/record?userId=7").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["parkId"], 42);
    assert_eq!(body["data"]["parkNum"], "B-42");

    let (returned, _) = call(h.app(), Method::POST, "/parking/parkings/return?userId=7").await;
    assert_eq!(returned, StatusCode::OK);
    let (after, _) = call(h.app(), Method::GET, "/parking/owner/record?userId=7").await;
    assert_eq!(after, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn correlation_id_is_echoed() {
    let h = Harness::new().with_owner(7);

    let response = h
        .app()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri(ASSIGN)
                .header("x-correlation-id", "trace-77")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()["x-correlation-id"], "trace-77");
    assert_eq!(h.broker.published()[0].correlation_id.as_deref(), Some("trace-77"));
}
