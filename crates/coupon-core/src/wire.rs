//! JSON request and response bodies. Field names are camelCase.

use crate::{
    campaign::Campaign,
    coupon::Redemption,
    ledger::StockSnapshot,
    types::{CampaignId, CouponId, IssuanceState, RequestId, RequesterId},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    pub requester_id: RequesterId,
    pub campaign_id: CampaignId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResponse {
    pub request_id: RequestId,
    pub state: IssuanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<CouponId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    /// Long-poll budget; absent or zero means answer immediately.
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockResponse {
    pub campaign_id: CampaignId,
    pub total: u64,
    pub remaining: u64,
    pub issued: u64,
}

impl StockResponse {
    pub const fn new(campaign_id: CampaignId, snapshot: StockSnapshot) -> Self {
        Self {
            campaign_id,
            total: snapshot.total,
            remaining: snapshot.remaining,
            issued: snapshot.reserved(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub campaign_id: CampaignId,
    pub total: u64,
    pub remaining: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemRequest {
    pub requester_id: RequesterId,
    pub coupon_id: CouponId,
    pub order_amount: u64,
    #[serde(default)]
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemResponse {
    pub coupon_id: CouponId,
    pub discount: u64,
    pub payable: u64,
}

impl From<Redemption> for RedeemResponse {
    fn from(value: Redemption) -> Self {
        Self {
            coupon_id: value.coupon_id,
            discount: value.discount,
            payable: value.payable,
        }
    }
}

/// A campaign currently open for issuance, with its live stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableCampaign {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub remaining: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub requester_id: RequesterId,
    pub coupon_id: CouponId,
    pub order_amount: u64,
}

/// Outcome of a discount preview. An unusable coupon is reported here with a
/// reason rather than as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub coupon_id: CouponId,
    pub requester_id: RequesterId,
    pub usable: bool,
    pub discount_amount: u64,
    pub final_amount: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidateResponse {
    pub fn usable(requester_id: RequesterId, redemption: Redemption) -> Self {
        Self {
            coupon_id: redemption.coupon_id,
            requester_id,
            usable: true,
            discount_amount: redemption.discount,
            final_amount: redemption.payable,
            reason: None,
        }
    }

    pub fn unusable(request: ValidateRequest, reason: String) -> Self {
        Self {
            coupon_id: request.coupon_id,
            requester_id: request.requester_id,
            usable: false,
            discount_amount: 0,
            final_amount: request.order_amount,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    Serving,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub queue_depth: usize,
    pub in_flight: usize,
    pub workers: usize,
    pub campaigns: usize,
    pub tracked_requests: usize,
    pub issued_coupons: usize,
    pub health: Health,
}
