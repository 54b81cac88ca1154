//! Owner fee API over in-memory storage and scripted downstreams.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use common::Harness;
use tower::ServiceExt;

async fn call(
    app: axum::Router,
    method: Method,
    uri: &str,
    caller: Option<&str>,
) -> (StatusCode, serde_json::Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(caller) = caller {
        request = request.header("x-user-id", caller);
    }
    let response = app.oneshot(request.body(Body::empty()).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).expect("envelope body"))
}

#[tokio::test]
async fn owner_sees_only_their_fees() {
    let h = Harness::new();
    h.unpaid_fee(7, 3);
    h.unpaid_fee(8, 4);

    let (status, body) = call(h.app(), Method::GET, "/fee/owner/my-fees", Some("7")).await;

    assert_eq!(status, StatusCode::OK);
    let fees = body["data"].as_array().unwrap();
    assert_eq!(fees.len(), 1);
    assert_eq!(fees[0]["userId"], 7);
    assert_eq!(fees[0]["amount"], "300.00");
    assert_eq!(fees[0]["billingMonth"], "2025-06");
}

#[tokio::test]
async fn missing_caller_is_401() {
    let h = Harness::new();

    let (status, body) = call(h.app(), Method::GET, "/fee/owner/unpaid", None).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
}

#[tokio::test]
async fn fee_detail_hides_other_owners_fees() {
    let h = Harness::new();
    let fee = h.unpaid_fee(7, 3);
    let uri = format!("/fee/owner/{}", fee.fee_id);

    let (own, body) = call(h.app(), Method::GET, &uri, Some("7")).await;
    let (other, _) = call(h.app(), Method::GET, &uri, Some("8")).await;
    let (garbage, _) = call(h.app(), Method::GET, "/fee/owner/abc", Some("7")).await;

    assert_eq!(own, StatusCode::OK);
    assert_eq!(body["data"]["status"], "unpaid");
    assert_eq!(other, StatusCode::NOT_FOUND);
    assert_eq!(garbage, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pay_then_unpaid_list_is_empty() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);

    let (status, body) = call(
        h.app(),
        Method::POST,
        &format!("/fee/owner/pay?parkFeeId={}", fee.fee_id),
        Some("7"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["fee"]["status"], "paid");
    assert!(body["data"]["eventId"].is_string());

    let (_, unpaid) = call(h.app(), Method::GET, "/fee/owner/unpaid", Some("7")).await;
    assert!(unpaid["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn payment_rejections_map_to_statuses() {
    let h = Harness::new().with_payer(7).with_payer(8).with_active_space(7, 9);
    let fee = h.unpaid_fee(7, 3);
    let pay = format!("/fee/owner/pay?parkFeeId={}", fee.fee_id);

    let (mismatch, body) = call(h.app(), Method::POST, &pay, Some("7")).await;
    assert_eq!(mismatch, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], 422);

    let (not_owner, body) = call(h.app(), Method::POST, &pay, Some("8")).await;
    assert_eq!(not_owner, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], format!("Fee {} not found", fee.fee_id));

    let (unknown, _) = call(h.app(), Method::POST, "/fee/owner/pay?parkFeeId=999", Some("7")).await;
    assert_eq!(unknown, StatusCode::NOT_FOUND);

    let (malformed, _) = call(h.app(), Method::POST, "/fee/owner/pay", Some("7")).await;
    assert_eq!(malformed, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn second_payment_conflicts() {
    let h = Harness::new().with_payer(7).with_active_space(7, 3);
    let fee = h.unpaid_fee(7, 3);
    let pay = format!("/fee/owner/pay?parkFeeId={}", fee.fee_id);

    call(h.app(), Method::POST, &pay, Some("7")).await;
    let (status, body) = call(h.app(), Method::POST, &pay, Some("7")).await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 409);
}

#[tokio::test]
async fn downstream_outage_is_503_without_internals() {
    let h = Harness::new();
    h.downstream.set_down(true);
    let fee = h.unpaid_fee(7, 3);

    let (status, body) = call(
        h.app(),
        Method::POST,
        &format!("/fee/owner/pay?parkFeeId={}", fee.fee_id),
        Some("7"),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!body["message"].as_str().unwrap().contains("connection refused"));
}

#[tokio::test]
async fn notifications_are_listed_for_the_caller() {
    let h = Harness::new();

    let (status, body) = call(h.app(), Method::GET, "/fee/owner/notifications", Some("7")).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());
}
