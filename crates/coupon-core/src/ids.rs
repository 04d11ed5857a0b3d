//! Snowflake-backed id minting for requests and coupons.
//!
//! A single lock-free [`AtomicSnowflakeGenerator`] is shared by every handler
//! task. Ids are time-ordered, so sorting request ids also sorts them by
//! admission time. The `machine_id` must be unique per running instance when
//! several instances share an id namespace.

use crate::{
    Error, Result,
    types::{CouponId, RequestId},
};
use core::time::Duration;
use std::time::Instant;
use ferroid::{
    generator::{AtomicSnowflakeGenerator, IdGenStatus},
    id::SnowflakeTwitterId,
    time::{MonotonicClock, TWITTER_EPOCH},
};

/// Longest a caller waits on a pending generator before giving up.
///
/// `Pending` means either another thread won the CAS or 4096 ids were already
/// minted this millisecond. Both clear by the next tick, so a healthy
/// generator is ready again well inside a millisecond.
const MAX_PENDING_WAIT: Duration = Duration::from_millis(5);

pub struct IdMint {
    generator: AtomicSnowflakeGenerator<SnowflakeTwitterId, MonotonicClock>,
}

impl IdMint {
    pub fn new(machine_id: u64) -> Self {
        Self {
            generator: AtomicSnowflakeGenerator::new(
                machine_id,
                MonotonicClock::with_epoch(TWITTER_EPOCH),
            ),
        }
    }

    /// Largest machine id the id layout can encode.
    pub fn max_machine_id() -> u64 {
        SnowflakeTwitterId::max_machine_id()
    }

    pub fn next_request_id(&self) -> Result<RequestId> {
        self.next_raw().map(RequestId::from)
    }

    pub fn next_coupon_id(&self) -> Result<CouponId> {
        self.next_raw().map(CouponId::from)
    }

    fn next_raw(&self) -> Result<String> {
        let deadline = Instant::now() + MAX_PENDING_WAIT;
        loop {
            match self.generator.try_next_id() {
                Ok(IdGenStatus::Ready { id }) => return Ok(id.to_raw().to_string()),
                Ok(IdGenStatus::Pending { .. }) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Internal {
                            context: "id generator stayed pending".to_string(),
                        });
                    }
                    std::thread::yield_now();
                }
                #[allow(unreachable_patterns)]
                Err(e) => {
                    return Err(Error::Internal {
                        context: format!("id generation failed: {e:?}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread::scope;

    #[test]
    fn ids_are_unique_across_threads() {
        let mint = IdMint::new(1);
        let seen = parking_lot::Mutex::new(HashSet::new());

        scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1_000 {
                        let id = mint.next_request_id().unwrap();
                        assert!(seen.lock().insert(id));
                    }
                });
            }
        });

        assert_eq!(seen.lock().len(), 4_000);
    }

    #[test]
    fn bursts_past_one_millisecond_stay_ordered() {
        let mint = IdMint::new(2);
        let ids: Vec<u64> = (0..10_000)
            .map(|_| mint.next_coupon_id().unwrap().to_string().parse().unwrap())
            .collect();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
