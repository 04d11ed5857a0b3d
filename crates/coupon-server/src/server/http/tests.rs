use super::routes::router;
use crate::server::{config::ServerConfig, service::handler::CouponService};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use coupon_core::types::CampaignId;
use serde_json::{Value, json};
use tower::ServiceExt;

fn build(tweak: impl FnOnce(&mut ServerConfig)) -> (CouponService, Router) {
    let mut config = ServerConfig::for_tests();
    config.seed_campaigns = vec![(CampaignId(1), 2)];
    tweak(&mut config);
    let service = CouponService::new(config).unwrap();
    (service.clone(), router(service))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };

    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn issue(app: &Router, requester: u64, campaign: u64) -> (StatusCode, Value) {
    call(
        app,
        Method::POST,
        "/coupons/issue",
        Some(json!({"requesterId": requester, "campaignId": campaign})),
    )
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn issue_then_poll_until_issued() {
    let (_, app) = build(|_| {});

    let (status, body) = issue(&app, 10, 1).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["state"], "PENDING");
    let request_id = body["requestId"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/coupons/status/{request_id}?waitMs=2000"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ISSUED");
    assert_eq!(body["campaignId"], 1);
    assert_eq!(body["requesterId"], 10);
    assert!(body["couponId"].is_string());
    assert!(body["resolvedAt"].is_u64());

    let (status, body) = call(&app, Method::GET, "/coupons/1/stock", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"campaignId": 1, "total": 2, "remaining": 1, "issued": 1})
    );

    let (_, coupons) = call(&app, Method::GET, "/coupons/users/10", None).await;
    assert_eq!(coupons.as_array().unwrap().len(), 1);
    assert_eq!(coupons[0]["redemption"], "UNREDEEMED");
}

#[tokio::test]
async fn bad_requests_map_to_error_codes() {
    let (_, app) = build(|_| {});

    let (status, body) = issue(&app, 1, 404).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "CAMPAIGN_NOT_FOUND");

    let (status, body) = call(
        &app,
        Method::POST,
        "/coupons/issue",
        Some(json!({"requester": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");

    let (status, body) = call(&app, Method::GET, "/coupons/status/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "REQUEST_NOT_FOUND");

    let (status, _) = call(&app, Method::GET, "/coupons/9/stock", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn overload_answers_429_with_retry_after() {
    let (_, app) = build(|config| {
        config.num_workers = 1;
        config.max_queue_depth = 1;
        config.retry_after_secs = 3;
    });

    // Both admissions run before the single worker gets a turn.
    let (status, _) = issue(&app, 1, 1).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/coupons/issue")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"requesterId": 2, "campaignId": 1}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "3");
}

#[tokio::test]
async fn reset_is_refused_while_in_flight() {
    let (_, app) = build(|_| {});
    let (status, _) = issue(&app, 1, 1).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = call(&app, Method::POST, "/coupons/1/initialize-stock", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "ISSUANCE_IN_FLIGHT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn campaign_registration_and_redemption() {
    let (_, app) = build(|_| {});

    let (status, body) = call(
        &app,
        Method::POST,
        "/coupons/campaigns",
        Some(json!({
            "campaignId": 5,
            "name": "spring sale",
            "totalStock": 3,
            "discount": {"kind": "PERCENTAGE", "value": 10, "maxDiscount": 5000, "minOrderAmount": 10000}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "spring sale");
    assert_eq!(body["totalStock"], 3);

    let (status, body) = call(
        &app,
        Method::POST,
        "/coupons/campaigns",
        Some(json!({"campaignId": 5, "totalStock": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "CAMPAIGN_EXISTS");

    let (status, body) = call(&app, Method::GET, "/coupons/campaigns/5", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["discount"]["kind"], "PERCENTAGE");

    let (_, body) = issue(&app, 8, 5).await;
    let request_id = body["requestId"].as_str().unwrap().to_string();
    let (_, body) = call(
        &app,
        Method::GET,
        &format!("/coupons/status/{request_id}?waitMs=2000"),
        None,
    )
    .await;
    let coupon_id = body["couponId"].as_str().unwrap().to_string();

    let redeem = |amount: u64| {
        json!({"requesterId": 8, "couponId": coupon_id, "orderAmount": amount, "orderId": "o-1"})
    };

    let (status, body) = call(&app, Method::POST, "/coupons/redeem", Some(redeem(5_000))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "ORDER_BELOW_MINIMUM");

    let (status, body) = call(&app, Method::POST, "/coupons/redeem", Some(redeem(30_000))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"couponId": coupon_id, "discount": 3_000, "payable": 27_000})
    );

    let (status, body) = call(&app, Method::POST, "/coupons/redeem", Some(redeem(30_000))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "COUPON_ALREADY_REDEEMED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_flips_during_shutdown() {
    let (service, app) = build(|_| {});

    let (status, _) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, Method::GET, "/coupons/system/status", None).await;
    assert_eq!(body["health"], "SERVING");
    assert_eq!(body["workers"], 2);
    assert_eq!(body["campaigns"], 1);

    service.shutdown().await.unwrap();

    let (status, _) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = issue(&app, 1, 1).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "SERVICE_SHUTDOWN");
}

#[tokio::test]
async fn malformed_path_and_query_answer_json_400() {
    let (_, app) = build(|_| {});

    for uri in [
        "/coupons/abc/stock",
        "/coupons/users/-4",
        "/coupons/status/some-id?waitMs=oops",
    ] {
        let (status, body) = call(&app, Method::GET, uri, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(body["error"], "INVALID_REQUEST", "{uri}");
        assert!(body["message"].is_string(), "{uri}");
    }

    let (status, body) = call(&app, Method::POST, "/coupons/x/initialize-stock", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn available_campaigns_and_discount_preview() {
    let (_, app) = build(|_| {});

    let (status, _) = call(
        &app,
        Method::POST,
        "/coupons/campaigns",
        Some(json!({
            "campaignId": 2,
            "totalStock": 5,
            "startsAt": 4_102_444_800_000_u64,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    // Campaign 2 has not opened yet.
    let (status, body) = call(&app, Method::GET, "/coupons/campaigns", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed = body.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], 1);
    assert_eq!(listed[0]["remaining"], 2);

    let (_, body) = issue(&app, 5, 1).await;
    let request_id = body["requestId"].as_str().unwrap().to_string();
    let (_, body) = call(
        &app,
        Method::GET,
        &format!("/coupons/status/{request_id}?waitMs=2000"),
        None,
    )
    .await;
    let coupon_id = body["couponId"].as_str().unwrap().to_string();

    let preview = json!({"requesterId": 5, "couponId": coupon_id, "orderAmount": 8_000});
    let (status, body) = call(&app, Method::POST, "/coupons/validate", Some(preview.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usable"], true);
    assert_eq!(body["discountAmount"], 1_000);
    assert_eq!(body["finalAmount"], 7_000);
    assert!(body.get("reason").is_none());

    let (_, coupons) = call(&app, Method::GET, "/coupons/users/5", None).await;
    assert_eq!(coupons[0]["redemption"], "UNREDEEMED");

    let (status, body) = call(
        &app,
        Method::POST,
        "/coupons/validate",
        Some(json!({"requesterId": 6, "couponId": coupon_id, "orderAmount": 8_000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["usable"], false);
    assert_eq!(body["discountAmount"], 0);
    assert_eq!(body["finalAmount"], 8_000);
    assert!(body["reason"].is_string());

    let (status, body) = call(
        &app,
        Method::POST,
        "/coupons/validate",
        Some(json!({"couponId": coupon_id})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "INVALID_REQUEST");
}
