#![doc = include_str!("../README.md")]

pub mod campaign;
pub mod coupon;
mod error;
pub mod ids;
pub mod ledger;
pub mod queue;
pub mod status;
pub mod tickets;
pub mod types;
pub mod wire;

pub use error::*;
