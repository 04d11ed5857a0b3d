//! Coupon campaign definitions and the in-memory catalog.
//!
//! A [`Campaign`] is immutable once registered: its total stock, active window
//! and discount policy never change during a run. Remaining stock lives in the
//! [`StockLedger`](crate::ledger::StockLedger), not here.

use crate::{
    Error, Result,
    types::{CampaignId, Millis},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountKind {
    /// `value` is an amount in minor currency units.
    Fixed,
    /// `value` is a percentage in `1..=100`.
    Percentage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscountPolicy {
    pub kind: DiscountKind,
    pub value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_discount: Option<u64>,
    #[serde(default)]
    pub min_order_amount: u64,
}

impl DiscountPolicy {
    pub const fn fixed(amount: u64) -> Self {
        Self {
            kind: DiscountKind::Fixed,
            value: amount,
            max_discount: None,
            min_order_amount: 0,
        }
    }

    fn validate(&self) -> Result<()> {
        match self.kind {
            DiscountKind::Fixed if self.value == 0 => Err(Error::InvalidRequest {
                reason: "fixed discount must be greater than 0".to_string(),
            }),
            DiscountKind::Percentage if !(1..=100).contains(&self.value) => {
                Err(Error::InvalidRequest {
                    reason: format!("percentage {} is outside 1..=100", self.value),
                })
            }
            _ => Ok(()),
        }
    }

    /// Computes the discount applied to an order of `order_amount`.
    ///
    /// The result is capped by `max_discount` and never exceeds the order
    /// amount itself.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OrderBelowMinimum`] when the order does not reach
    /// `min_order_amount`.
    pub fn discount_for(&self, order_amount: u64) -> Result<u64> {
        if order_amount < self.min_order_amount {
            return Err(Error::OrderBelowMinimum {
                amount: order_amount,
                minimum: self.min_order_amount,
            });
        }

        let raw = match self.kind {
            DiscountKind::Fixed => self.value,
            DiscountKind::Percentage => order_amount.saturating_mul(self.value) / 100,
        };
        let capped = self.max_discount.map_or(raw, |max| raw.min(max));
        Ok(capped.min(order_amount))
    }
}

/// Optional issuance window, in milliseconds since the UNIX epoch. `starts_at`
/// is inclusive and `ends_at` exclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<Millis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<Millis>,
}

impl ActiveWindow {
    /// Returns the reason the window is closed at `now`, if it is.
    pub fn closed_reason(&self, now: Millis) -> Option<String> {
        match (self.starts_at, self.ends_at) {
            (Some(start), _) if now < start => Some(format!("starts at {start}")),
            (_, Some(end)) if now >= end => Some(format!("ended at {end}")),
            _ => None,
        }
    }

    pub fn has_ended(&self, now: Millis) -> bool {
        self.ends_at.is_some_and(|end| now >= end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub total_stock: u64,
    #[serde(flatten)]
    pub window: ActiveWindow,
    pub discount: DiscountPolicy,
    pub created_at: Millis,
}

impl Campaign {
    /// Checks that the campaign accepts issuance at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CampaignInactive`] when outside the active window.
    pub fn ensure_active(&self, now: Millis) -> Result<()> {
        match self.window.closed_reason(now) {
            Some(reason) => Err(Error::CampaignInactive {
                campaign_id: self.id,
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Registration payload for a new campaign.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSpec {
    pub campaign_id: CampaignId,
    #[serde(default)]
    pub name: Option<String>,
    pub total_stock: u64,
    #[serde(flatten)]
    pub window: ActiveWindow,
    #[serde(default)]
    pub discount: Option<DiscountPolicy>,
}

impl CampaignSpec {
    /// Shorthand for seeded campaigns: unlimited window and a fixed discount.
    pub fn seeded(campaign_id: CampaignId, total_stock: u64, default_discount: u64) -> Self {
        Self {
            campaign_id,
            name: None,
            total_stock,
            window: ActiveWindow::default(),
            discount: Some(DiscountPolicy::fixed(default_discount)),
        }
    }

    /// Validates the definition and builds an immutable [`Campaign`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] on zero stock, an inverted window, or
    /// an out-of-range discount.
    pub fn build(self, now: Millis, default_discount: u64) -> Result<Campaign> {
        if self.total_stock == 0 {
            return Err(Error::InvalidRequest {
                reason: "totalStock must be greater than 0".to_string(),
            });
        }
        if let (Some(start), Some(end)) = (self.window.starts_at, self.window.ends_at) {
            if start >= end {
                return Err(Error::InvalidRequest {
                    reason: format!("startsAt ({start}) must precede endsAt ({end})"),
                });
            }
        }

        let discount = self
            .discount
            .unwrap_or_else(|| DiscountPolicy::fixed(default_discount));
        discount.validate()?;

        Ok(Campaign {
            id: self.campaign_id,
            name: self
                .name
                .unwrap_or_else(|| format!("campaign-{}", self.campaign_id)),
            total_stock: self.total_stock,
            window: self.window,
            discount,
            created_at: now,
        })
    }
}

/// Registry of every campaign known to this instance.
#[derive(Default)]
pub struct CampaignCatalog {
    campaigns: RwLock<HashMap<CampaignId, Arc<Campaign>>>,
}

impl CampaignCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns [`Error::CampaignExists`] if the id is already taken.
    pub fn register(&self, campaign: Campaign) -> Result<Arc<Campaign>> {
        let mut campaigns = self.campaigns.write();
        if campaigns.contains_key(&campaign.id) {
            return Err(Error::CampaignExists(campaign.id));
        }
        let campaign = Arc::new(campaign);
        campaigns.insert(campaign.id, Arc::clone(&campaign));
        Ok(campaign)
    }

    /// # Errors
    ///
    /// Returns [`Error::CampaignNotFound`] for unknown ids.
    pub fn get(&self, id: CampaignId) -> Result<Arc<Campaign>> {
        self.campaigns
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::CampaignNotFound(id))
    }

    /// Every registered campaign, ordered by id.
    pub fn list(&self) -> Vec<Arc<Campaign>> {
        let mut campaigns: Vec<_> = self.campaigns.read().values().cloned().collect();
        campaigns.sort_by_key(|campaign| campaign.id);
        campaigns
    }

    pub fn len(&self) -> usize {
        self.campaigns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percentage(value: u64, max: Option<u64>, min_order: u64) -> DiscountPolicy {
        DiscountPolicy {
            kind: DiscountKind::Percentage,
            value,
            max_discount: max,
            min_order_amount: min_order,
        }
    }

    #[test]
    fn percentage_discount_is_capped() {
        let policy = percentage(10, Some(3_000), 10_000);
        assert_eq!(policy.discount_for(20_000), Ok(2_000));
        assert_eq!(policy.discount_for(50_000), Ok(3_000));
        assert_eq!(
            policy.discount_for(9_999),
            Err(Error::OrderBelowMinimum {
                amount: 9_999,
                minimum: 10_000
            })
        );
    }

    #[test]
    fn fixed_discount_never_exceeds_order() {
        let policy = DiscountPolicy::fixed(5_000);
        assert_eq!(policy.discount_for(12_000), Ok(5_000));
        assert_eq!(policy.discount_for(3_000), Ok(3_000));
    }

    #[test]
    fn window_bounds() {
        let window = ActiveWindow {
            starts_at: Some(100),
            ends_at: Some(200),
        };
        assert!(window.closed_reason(99).is_some());
        assert!(window.closed_reason(100).is_none());
        assert!(window.closed_reason(199).is_none());
        assert!(window.closed_reason(200).is_some());
        assert!(window.has_ended(200));
        assert!(!ActiveWindow::default().has_ended(u64::MAX));
    }

    #[test]
    fn spec_validation() {
        let zero = CampaignSpec::seeded(CampaignId(1), 0, 1_000);
        assert!(matches!(
            zero.build(0, 1_000),
            Err(Error::InvalidRequest { .. })
        ));

        let mut bad_pct = CampaignSpec::seeded(CampaignId(2), 10, 1_000);
        bad_pct.discount = Some(percentage(150, None, 0));
        assert!(bad_pct.build(0, 1_000).is_err());

        let mut inverted = CampaignSpec::seeded(CampaignId(3), 10, 1_000);
        inverted.window = ActiveWindow {
            starts_at: Some(10),
            ends_at: Some(5),
        };
        assert!(inverted.build(0, 1_000).is_err());
    }

    #[test]
    fn catalog_rejects_duplicates() {
        let catalog = CampaignCatalog::new();
        let campaign = CampaignSpec::seeded(CampaignId(1), 10, 1_000)
            .build(0, 1_000)
            .unwrap();
        catalog.register(campaign.clone()).unwrap();
        assert_eq!(
            catalog.register(campaign),
            Err(Error::CampaignExists(CampaignId(1)))
        );
        assert_eq!(
            catalog.get(CampaignId(9)).unwrap_err(),
            Error::CampaignNotFound(CampaignId(9))
        );
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn catalog_lists_by_id() {
        let catalog = CampaignCatalog::new();
        for id in [7, 2, 5] {
            let campaign = CampaignSpec::seeded(CampaignId(id), 10, 1_000)
                .build(0, 1_000)
                .unwrap();
            catalog.register(campaign).unwrap();
        }
        let ids: Vec<_> = catalog.list().iter().map(|c| c.id.0).collect();
        assert_eq!(ids, [2, 5, 7]);
    }
}
