use coupon_core::{
    campaign::CampaignCatalog, coupon::CouponBook, ids::IdMint, ledger::StockLedger,
    status::StatusStore, tickets::TicketIndex,
};

/// State shared by HTTP handlers, dispatcher workers and the sweeper.
///
/// Each store synchronizes itself; none of them is ever locked across an
/// `.await`.
pub struct Stores {
    pub catalog: CampaignCatalog,
    pub ledger: StockLedger,
    pub coupons: CouponBook,
    pub status: StatusStore,
    pub tickets: TicketIndex,
    pub ids: IdMint,
}
