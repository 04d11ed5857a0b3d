//! Remaining-stock ledger.
//!
//! Each campaign owns one counter. [`StockLedger::try_reserve`] is the only
//! mutator used during live issuance: a compare-and-swap loop that decrements
//! the counter only while it is positive, so concurrent workers can never
//! drive it below zero. Callers never see a read-then-write pair.

use crate::types::CampaignId;
use parking_lot::RwLock;
use portable_atomic::{AtomicU64, Ordering};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};

struct StockCell {
    total: AtomicU64,
    remaining: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StockSnapshot {
    pub total: u64,
    pub remaining: u64,
}

impl StockSnapshot {
    pub const fn reserved(&self) -> u64 {
        self.total - self.remaining
    }
}

#[derive(Default)]
pub struct StockLedger {
    // The map lock only guards campaign registration; counters are mutated
    // through their own atomics under a read guard.
    cells: RwLock<HashMap<CampaignId, Arc<StockCell>>>,
}

impl StockLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the counter for `campaign` with `total` units. Registering an
    /// existing campaign leaves its counter untouched and returns `false`.
    pub fn register(&self, campaign: CampaignId, total: u64) -> bool {
        let mut cells = self.cells.write();
        if cells.contains_key(&campaign) {
            return false;
        }
        cells.insert(
            campaign,
            Arc::new(StockCell {
                total: AtomicU64::new(total),
                remaining: AtomicU64::new(total),
            }),
        );
        true
    }

    fn cell(&self, campaign: CampaignId) -> Option<Arc<StockCell>> {
        self.cells.read().get(&campaign).cloned()
    }

    /// Atomically takes one unit if any remain.
    ///
    /// Returns `false` when the campaign is exhausted or unknown. This is the
    /// single gate against overselling and behaves as if globally serialized
    /// per campaign.
    pub fn try_reserve(&self, campaign: CampaignId) -> bool {
        let Some(cell) = self.cell(campaign) else {
            return false;
        };

        let mut current = cell.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match cell.remaining.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                // Lost the race: retry against the value the winner left.
                Err(actual) => current = actual,
            }
        }
    }

    /// Gives back a unit taken by [`Self::try_reserve`] that could not be
    /// turned into an issued coupon. Never raises remaining above total.
    pub fn restore(&self, campaign: CampaignId) -> bool {
        let Some(cell) = self.cell(campaign) else {
            return false;
        };
        let total = cell.total.load(Ordering::Acquire);
        cell.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                (remaining < total).then_some(remaining + 1)
            })
            .is_ok()
    }

    /// Sets remaining stock back to `total`. Administrative use only: callers
    /// must ensure no issuance is in flight for the campaign.
    pub fn reset(&self, campaign: CampaignId, total: u64) -> StockSnapshot {
        let cell = {
            let mut cells = self.cells.write();
            Arc::clone(cells.entry(campaign).or_insert_with(|| {
                Arc::new(StockCell {
                    total: AtomicU64::new(total),
                    remaining: AtomicU64::new(total),
                })
            }))
        };
        cell.total.store(total, Ordering::Release);
        cell.remaining.store(total, Ordering::Release);

        tracing::info!(campaign = %campaign, total, "Stock reset");
        StockSnapshot {
            total,
            remaining: total,
        }
    }

    /// Remaining units, or `None` for an unknown campaign.
    pub fn peek(&self, campaign: CampaignId) -> Option<u64> {
        self.cell(campaign)
            .map(|cell| cell.remaining.load(Ordering::Acquire))
    }

    pub fn snapshot(&self, campaign: CampaignId) -> Option<StockSnapshot> {
        self.cell(campaign).map(|cell| StockSnapshot {
            total: cell.total.load(Ordering::Acquire),
            remaining: cell.remaining.load(Ordering::Acquire),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::scope;

    #[test]
    fn reserve_stops_at_zero() {
        let ledger = StockLedger::new();
        assert!(ledger.register(CampaignId(1), 2));
        assert!(ledger.try_reserve(CampaignId(1)));
        assert!(ledger.try_reserve(CampaignId(1)));
        assert!(!ledger.try_reserve(CampaignId(1)));
        assert_eq!(ledger.peek(CampaignId(1)), Some(0));
    }

    #[test]
    fn unknown_campaign_is_a_plain_false() {
        let ledger = StockLedger::new();
        assert!(!ledger.try_reserve(CampaignId(404)));
        assert_eq!(ledger.peek(CampaignId(404)), None);
        assert!(!ledger.restore(CampaignId(404)));
    }

    #[test]
    fn concurrent_reservations_never_oversell() {
        let ledger = StockLedger::new();
        ledger.register(CampaignId(7), 100);
        let granted = portable_atomic::AtomicUsize::new(0);

        scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if ledger.try_reserve(CampaignId(7)) {
                            granted.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                });
            }
        });

        assert_eq!(granted.load(Ordering::Relaxed), 100);
        assert_eq!(ledger.peek(CampaignId(7)), Some(0));
    }

    #[test]
    fn release_is_capped_at_total() {
        let ledger = StockLedger::new();
        ledger.register(CampaignId(1), 1);
        assert!(!ledger.restore(CampaignId(1)));
        assert!(ledger.try_reserve(CampaignId(1)));
        assert!(ledger.restore(CampaignId(1)));
        assert_eq!(ledger.peek(CampaignId(1)), Some(1));
    }

    #[test]
    fn reset_restores_total_and_register_is_idempotent() {
        let ledger = StockLedger::new();
        ledger.register(CampaignId(3), 5);
        while ledger.try_reserve(CampaignId(3)) {}
        assert!(!ledger.register(CampaignId(3), 99));
        assert_eq!(ledger.peek(CampaignId(3)), Some(0));

        let snapshot = ledger.reset(CampaignId(3), 10);
        assert_eq!(snapshot.remaining, 10);
        assert_eq!(ledger.snapshot(CampaignId(3)).unwrap().reserved(), 0);
    }
}
