//! Error types for the coupon issuance service.
//!
//! This module defines the central `Error` enum, which captures all recoverable
//! and reportable error cases of admission, inspection, and redemption. It
//! implements [`IntoResponse`] so handlers can return `Result<_, Error>` and
//! have each case surface with an appropriate HTTP status code and a JSON body.
//!
//! ## Error Cases
//! - `Overloaded`: The request queue for a campaign is at capacity.
//! - `CampaignNotFound` / `RequestNotFound` / `CouponNotFound`: Unknown ids.
//! - `CampaignInactive`: The campaign's active window is closed.
//! - `CampaignExists`: A campaign with the same id is already registered.
//! - `IssuanceInFlight`: A stock reset was attempted while requests are queued.
//! - `CouponAlreadyIssued`: The requester already owns a coupon of the campaign.
//! - `CouponNotOwned` / `CouponAlreadyRedeemed` / `OrderBelowMinimum`:
//!   Redemption was refused.
//! - `InvalidTransition`: A status update would move a request backwards.
//! - `InvalidRequest`: The client request was malformed or exceeded bounds.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.
//! - `Internal`: An unexpected failure (e.g., ID generation).
//!
//! Stock exhaustion has no variant here. Running out of stock is a `false`
//! from the ledger and surfaces as a `SOLD_OUT` state.

use crate::types::{CampaignId, CouponId, IssuanceState, RequestId, RequesterId};
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the coupon issuance service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The campaign queue cannot accept more requests right now.
    #[error("Service is overloaded: {details}")]
    Overloaded { details: String, retry_after_secs: u64 },

    #[error("Campaign {0} not found")]
    CampaignNotFound(CampaignId),

    /// The campaign exists but is outside its active window.
    #[error("Campaign {campaign_id} is not active: {reason}")]
    CampaignInactive {
        campaign_id: CampaignId,
        reason: String,
    },

    #[error("Campaign {0} already exists")]
    CampaignExists(CampaignId),

    /// Stock cannot be reset while requests for the campaign are queued or
    /// being processed.
    #[error("Campaign {campaign_id} has {in_flight} requests in flight")]
    IssuanceInFlight {
        campaign_id: CampaignId,
        in_flight: usize,
    },

    #[error("Request {0} not found")]
    RequestNotFound(RequestId),

    #[error("Coupon {0} not found")]
    CouponNotFound(CouponId),

    #[error("Requester {requester_id} already holds a coupon of campaign {campaign_id}")]
    CouponAlreadyIssued {
        campaign_id: CampaignId,
        requester_id: RequesterId,
    },

    #[error("Coupon {0} is not owned by the requester")]
    CouponNotOwned(CouponId),

    #[error("Coupon {0} was already redeemed")]
    CouponAlreadyRedeemed(CouponId),

    #[error("Order amount {amount} is below the minimum of {minimum}")]
    OrderBelowMinimum { amount: u64, minimum: u64 },

    #[error("Request {request_id} cannot move from {from} to {to}")]
    InvalidTransition {
        request_id: RequestId,
        from: IssuanceState,
        to: IssuanceState,
    },

    /// The client request was invalid or exceeded constraints.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,

    #[error("Internal error: {context}")]
    Internal { context: String },
}

impl Error {
    /// Stable, machine-readable code for the error body.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Overloaded { .. } => "OVERLOADED",
            Self::CampaignNotFound(_) => "CAMPAIGN_NOT_FOUND",
            Self::CampaignInactive { .. } => "CAMPAIGN_INACTIVE",
            Self::CampaignExists(_) => "CAMPAIGN_EXISTS",
            Self::IssuanceInFlight { .. } => "ISSUANCE_IN_FLIGHT",
            Self::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            Self::CouponNotFound(_) => "COUPON_NOT_FOUND",
            Self::CouponAlreadyIssued { .. } => "COUPON_ALREADY_ISSUED",
            Self::CouponNotOwned(_) => "COUPON_NOT_OWNED",
            Self::CouponAlreadyRedeemed(_) => "COUPON_ALREADY_REDEEMED",
            Self::OrderBelowMinimum { .. } => "ORDER_BELOW_MINIMUM",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::InvalidRequest { .. } => "INVALID_REQUEST",
            Self::ServiceShutdown => "SERVICE_SHUTDOWN",
            Self::Internal { .. } => "INTERNAL",
        }
    }

    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Overloaded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CampaignNotFound(_) | Self::RequestNotFound(_) | Self::CouponNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::CampaignInactive { .. }
            | Self::CampaignExists(_)
            | Self::IssuanceInFlight { .. }
            | Self::CouponAlreadyIssued { .. }
            | Self::CouponAlreadyRedeemed(_)
            | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::CouponNotOwned(_) => StatusCode::FORBIDDEN,
            Self::OrderBelowMinimum { .. } | Self::InvalidRequest { .. } => {
                StatusCode::BAD_REQUEST
            }
            Self::ServiceShutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
        };
        let mut response = (self.status_code(), Json(body)).into_response();
        if let Self::Overloaded {
            retry_after_secs, ..
        } = self
        {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_maps_to_429_with_retry_after() {
        let err = Error::Overloaded {
            details: "campaign 7 queue is full".to_string(),
            retry_after_secs: 2,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(RETRY_AFTER),
            Some(&HeaderValue::from(2_u64))
        );
    }

    #[test]
    fn shutdown_and_overload_are_distinct() {
        assert_eq!(
            Error::ServiceShutdown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::RequestNotFound(RequestId::from("42")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::CouponAlreadyRedeemed(CouponId::from("9")).code(),
            "COUPON_ALREADY_REDEEMED"
        );
    }
}
