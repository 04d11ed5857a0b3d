//! Issuance service and the state it shares with the worker pool.
//!
//! ## Structure
//!
//! - [`handler`] - `CouponService`, the entry point used by HTTP handlers.
//! - [`stores`] - campaign, stock, coupon, status and ticket stores.

pub mod handler;
pub mod stores;
