//! Issued coupons, their owners, and redemption.
//!
//! The book holds at most one coupon per (requester, campaign). A coupon is
//! redeemed at most once, and only by its owner.

use crate::{
    Error, Result,
    campaign::Campaign,
    types::{CampaignId, CouponId, Millis, RequestId, RequesterId},
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RedemptionState {
    Unredeemed,
    Redeemed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCoupon {
    pub coupon_id: CouponId,
    pub campaign_id: CampaignId,
    pub owner: RequesterId,
    /// The issuance request that produced this coupon.
    pub request_id: RequestId,
    pub issued_at: Millis,
    pub redemption: RedemptionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redeemed_at: Option<Millis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// Result of applying a coupon to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub coupon_id: CouponId,
    pub discount: u64,
    pub payable: u64,
}

#[derive(Default)]
struct Book {
    coupons: HashMap<CouponId, IssuedCoupon>,
    owners: HashMap<(RequesterId, CampaignId), CouponId>,
    per_campaign: HashMap<CampaignId, u64>,
}

#[derive(Default)]
pub struct CouponBook {
    inner: RwLock<Book>,
}

impl CouponBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly issued coupon.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CouponAlreadyIssued`] if `owner` already holds a coupon
    /// of `campaign_id`.
    pub fn issue(
        &self,
        coupon_id: CouponId,
        campaign_id: CampaignId,
        owner: RequesterId,
        request_id: RequestId,
        issued_at: Millis,
    ) -> Result<IssuedCoupon> {
        let mut book = self.inner.write();
        if book.owners.contains_key(&(owner, campaign_id)) {
            return Err(Error::CouponAlreadyIssued {
                campaign_id,
                requester_id: owner,
            });
        }

        let coupon = IssuedCoupon {
            coupon_id: coupon_id.clone(),
            campaign_id,
            owner,
            request_id,
            issued_at,
            redemption: RedemptionState::Unredeemed,
            redeemed_at: None,
            order_id: None,
        };
        book.owners.insert((owner, campaign_id), coupon_id.clone());
        *book.per_campaign.entry(campaign_id).or_default() += 1;
        book.coupons.insert(coupon_id, coupon.clone());
        Ok(coupon)
    }

    /// # Errors
    ///
    /// Returns [`Error::CouponNotFound`] for unknown ids.
    pub fn get(&self, coupon_id: &CouponId) -> Result<IssuedCoupon> {
        self.inner
            .read()
            .coupons
            .get(coupon_id)
            .cloned()
            .ok_or_else(|| Error::CouponNotFound(coupon_id.clone()))
    }

    pub fn owned(&self, owner: RequesterId, campaign_id: CampaignId) -> Option<IssuedCoupon> {
        let book = self.inner.read();
        book.owners
            .get(&(owner, campaign_id))
            .and_then(|id| book.coupons.get(id))
            .cloned()
    }

    /// Every coupon held by `owner`, oldest first.
    pub fn list_for(&self, owner: RequesterId) -> Vec<IssuedCoupon> {
        let mut coupons: Vec<_> = self
            .inner
            .read()
            .coupons
            .values()
            .filter(|coupon| coupon.owner == owner)
            .cloned()
            .collect();
        coupons.sort_by(|a, b| {
            a.issued_at
                .cmp(&b.issued_at)
                .then_with(|| a.coupon_id.cmp(&b.coupon_id))
        });
        coupons
    }

    pub fn count_for(&self, campaign_id: CampaignId) -> u64 {
        self.inner
            .read()
            .per_campaign
            .get(&campaign_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.inner.read().coupons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Computes what redeeming `coupon_id` against an order would yield,
    /// without using the coupon up.
    ///
    /// # Errors
    ///
    /// Same as [`CouponBook::redeem`].
    pub fn validate(
        &self,
        requester: RequesterId,
        coupon_id: &CouponId,
        order_amount: u64,
        campaign: &Campaign,
        now: Millis,
    ) -> Result<Redemption> {
        let book = self.inner.read();
        let coupon = book
            .coupons
            .get(coupon_id)
            .ok_or_else(|| Error::CouponNotFound(coupon_id.clone()))?;
        let discount = check_usable(coupon, requester, order_amount, campaign, now)?;
        Ok(Redemption {
            coupon_id: coupon_id.clone(),
            discount,
            payable: order_amount - discount,
        })
    }

    /// Applies `coupon_id` to an order of `order_amount`.
    ///
    /// `campaign` must be the coupon's campaign; its window decides expiry and
    /// its policy the discount.
    ///
    /// # Errors
    ///
    /// - [`Error::CouponNotFound`] for unknown ids.
    /// - [`Error::CouponNotOwned`] if `requester` is not the owner.
    /// - [`Error::CouponAlreadyRedeemed`] on a second redemption.
    /// - [`Error::CampaignInactive`] once the campaign window has ended.
    /// - [`Error::OrderBelowMinimum`] from the discount policy.
    pub fn redeem(
        &self,
        requester: RequesterId,
        coupon_id: &CouponId,
        order_amount: u64,
        order_id: Option<String>,
        campaign: &Campaign,
        now: Millis,
    ) -> Result<Redemption> {
        let mut book = self.inner.write();
        let coupon = book
            .coupons
            .get_mut(coupon_id)
            .ok_or_else(|| Error::CouponNotFound(coupon_id.clone()))?;

        let discount = check_usable(coupon, requester, order_amount, campaign, now)?;
        coupon.redemption = RedemptionState::Redeemed;
        coupon.redeemed_at = Some(now);
        coupon.order_id = order_id;

        Ok(Redemption {
            coupon_id: coupon_id.clone(),
            discount,
            payable: order_amount - discount,
        })
    }
}

/// Shared by validation and redemption; returns the discount on success.
fn check_usable(
    coupon: &IssuedCoupon,
    requester: RequesterId,
    order_amount: u64,
    campaign: &Campaign,
    now: Millis,
) -> Result<u64> {
    if coupon.owner != requester {
        return Err(Error::CouponNotOwned(coupon.coupon_id.clone()));
    }
    if coupon.redemption == RedemptionState::Redeemed {
        return Err(Error::CouponAlreadyRedeemed(coupon.coupon_id.clone()));
    }
    if campaign.window.has_ended(now) {
        return Err(Error::CampaignInactive {
            campaign_id: campaign.id,
            reason: "coupon expired".to_string(),
        });
    }
    campaign.discount.discount_for(order_amount)
}
