//! Dispatcher workers draining the request queue.
//!
//! - [`manager`] - owns the queue handle and coordinates shutdown.
//! - [`worker`] - per-partition loop that resolves each request.

pub mod manager;
pub mod worker;
