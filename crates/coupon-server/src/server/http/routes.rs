//! HTTP surface of the coupon service.
//!
//! Every handler is a thin adapter over [`CouponService`]. Failures are
//! returned as [`coupon_core::Error`], which renders its own status code and
//! JSON body. Extractor rejections (bad JSON, path or query values) are
//! folded into [`Error::InvalidRequest`] so they render the same way.

use crate::server::service::handler::{Admission, CouponService};
use axum::{
    Json, Router,
    extract::{
        Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use core::time::Duration;
use coupon_core::{
    Error, Result,
    campaign::{Campaign, CampaignSpec},
    coupon::IssuedCoupon,
    status::StatusRecord,
    types::{CampaignId, RequestId, RequesterId},
    wire::{
        AvailableCampaign, IssueRequest, RedeemRequest, RedeemResponse, ResetResponse,
        StatusQuery, StockResponse, SystemStatus, ValidateRequest, ValidateResponse,
    },
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub fn router(service: CouponService) -> Router {
    Router::new()
        .route("/coupons/issue", post(issue))
        .route("/coupons/status/{request_id}", get(status))
        .route("/coupons/{campaign_id}/stock", get(stock))
        .route("/coupons/{campaign_id}/initialize-stock", post(initialize_stock))
        .route(
            "/coupons/campaigns",
            get(available_campaigns).post(register_campaign),
        )
        .route("/coupons/campaigns/{campaign_id}", get(campaign))
        .route("/coupons/users/{requester_id}", get(coupons_of))
        .route("/coupons/redeem", post(redeem))
        .route("/coupons/validate", post(validate))
        .route("/coupons/system/status", get(system_status))
        .route("/health", get(health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(service)
}

impl IntoResponse for Admission {
    fn into_response(self) -> Response {
        match self {
            Self::Queued(body) => (StatusCode::ACCEPTED, Json(body)).into_response(),
            Self::Resolved(body) => (StatusCode::OK, Json(body)).into_response(),
        }
    }
}

type Extracted<T, R> = core::result::Result<T, R>;

fn extracted<T, R: core::fmt::Display>(value: Extracted<T, R>) -> Result<T> {
    value.map_err(|rejection| Error::InvalidRequest {
        reason: rejection.to_string(),
    })
}

async fn issue(
    State(service): State<CouponService>,
    payload: Extracted<Json<IssueRequest>, JsonRejection>,
) -> Result<Admission> {
    let Json(req) = extracted(payload)?;
    service.issue(req)
}

async fn status(
    State(service): State<CouponService>,
    Path(request_id): Path<String>,
    query: Extracted<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<StatusRecord>> {
    let Query(query) = extracted(query)?;
    let wait = query.wait_ms.map(Duration::from_millis);
    service
        .status(&RequestId::from(request_id), wait)
        .await
        .map(Json)
}

async fn stock(
    State(service): State<CouponService>,
    campaign_id: Extracted<Path<u64>, PathRejection>,
) -> Result<Json<StockResponse>> {
    let Path(campaign_id) = extracted(campaign_id)?;
    service.stock(CampaignId(campaign_id)).map(Json)
}

async fn initialize_stock(
    State(service): State<CouponService>,
    campaign_id: Extracted<Path<u64>, PathRejection>,
) -> Result<Json<ResetResponse>> {
    let Path(campaign_id) = extracted(campaign_id)?;
    service.initialize_stock(CampaignId(campaign_id)).map(Json)
}

async fn available_campaigns(
    State(service): State<CouponService>,
) -> Json<Vec<AvailableCampaign>> {
    Json(service.available_campaigns())
}

async fn register_campaign(
    State(service): State<CouponService>,
    payload: Extracted<Json<CampaignSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<Campaign>)> {
    let Json(spec) = extracted(payload)?;
    let campaign = service.register_campaign(spec)?;
    Ok((StatusCode::CREATED, Json(Campaign::clone(&campaign))))
}

async fn campaign(
    State(service): State<CouponService>,
    campaign_id: Extracted<Path<u64>, PathRejection>,
) -> Result<Json<Campaign>> {
    let Path(campaign_id) = extracted(campaign_id)?;
    service
        .campaign(CampaignId(campaign_id))
        .map(|campaign| Json(Campaign::clone(&campaign)))
}

async fn coupons_of(
    State(service): State<CouponService>,
    requester_id: Extracted<Path<u64>, PathRejection>,
) -> Result<Json<Vec<IssuedCoupon>>> {
    let Path(requester_id) = extracted(requester_id)?;
    Ok(Json(service.coupons_of(RequesterId(requester_id))))
}

async fn redeem(
    State(service): State<CouponService>,
    payload: Extracted<Json<RedeemRequest>, JsonRejection>,
) -> Result<Json<RedeemResponse>> {
    let Json(req) = extracted(payload)?;
    service.redeem(req).map(Json)
}

async fn validate(
    State(service): State<CouponService>,
    payload: Extracted<Json<ValidateRequest>, JsonRejection>,
) -> Result<Json<ValidateResponse>> {
    let Json(req) = extracted(payload)?;
    Ok(Json(service.validate(req)))
}

async fn system_status(State(service): State<CouponService>) -> Json<SystemStatus> {
    Json(service.system_status())
}

async fn health(State(service): State<CouponService>) -> (StatusCode, &'static str) {
    if service.is_serving() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down")
    }
}
