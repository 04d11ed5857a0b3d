//! Request id → lifecycle state.
//!
//! The store is split into independently locked shards. A request id always
//! hashes to the same shard, so readers and writers of different requests
//! rarely contend, and no operation ever takes more than one shard lock.
//!
//! Every write goes through [`IssuanceState::can_advance_to`]: a record only
//! moves forward and never leaves a terminal state. Terminal records are kept
//! for at least the retention TTL and then removed by
//! [`StatusStore::purge_expired`].

use crate::{
    Error, Result,
    types::{CampaignId, CouponId, IssuanceState, Millis, RequestId, RequesterId, now_millis},
};
use core::time::Duration;
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    pin::pin,
};
use tokio::{sync::Notify, time::Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub request_id: RequestId,
    pub campaign_id: CampaignId,
    pub requester_id: RequesterId,
    pub state: IssuanceState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<CouponId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub requested_at: Millis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<Millis>,
}

impl StatusRecord {
    pub const fn pending(
        request_id: RequestId,
        campaign_id: CampaignId,
        requester_id: RequesterId,
        requested_at: Millis,
    ) -> Self {
        Self {
            request_id,
            campaign_id,
            requester_id,
            state: IssuanceState::Pending,
            coupon_id: None,
            reason: None,
            requested_at,
            resolved_at: None,
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Issued(CouponId),
    SoldOut,
    Failed(String),
}

impl Resolution {
    pub const fn state(&self) -> IssuanceState {
        match self {
            Self::Issued(_) => IssuanceState::Issued,
            Self::SoldOut => IssuanceState::SoldOut,
            Self::Failed(_) => IssuanceState::Failed,
        }
    }
}

struct Entry {
    record: StatusRecord,
    /// Monotonic instant the record became terminal, used for retention.
    resolved: Option<Instant>,
}

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<RequestId, Entry>>,
    /// Woken on every terminal write into this shard.
    resolved: Notify,
}

pub struct StatusStore {
    shards: Box<[Shard]>,
    ttl: Duration,
}

impl StatusStore {
    pub fn new(shard_count: usize, ttl: Duration) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Shard::default()).collect();
        Self { shards, ttl }
    }

    fn shard(&self, id: &RequestId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.shards[(hasher.finish() % self.shards.len() as u64) as usize]
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        entry
            .resolved
            .is_some_and(|resolved| now.saturating_duration_since(resolved) > self.ttl)
    }

    /// Writes `record` as-is, replacing any previous record for the id.
    pub fn put(&self, record: StatusRecord) {
        let shard = self.shard(&record.request_id);
        let terminal = record.state.is_terminal();
        let entry = Entry {
            resolved: terminal.then(Instant::now),
            record,
        };
        shard
            .entries
            .write()
            .insert(entry.record.request_id.clone(), entry);
        if terminal {
            shard.resolved.notify_waiters();
        }
    }

    /// Returns the record for `id`, or `None` if it is unknown or has outlived
    /// its retention.
    pub fn get(&self, id: &RequestId) -> Option<StatusRecord> {
        let now = Instant::now();
        self.shard(id)
            .entries
            .read()
            .get(id)
            .filter(|entry| !self.is_expired(entry, now))
            .map(|entry| entry.record.clone())
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.get(id).is_some()
    }

    /// Moves a record to a non-terminal `next` state.
    ///
    /// # Errors
    ///
    /// - [`Error::RequestNotFound`] for unknown ids.
    /// - [`Error::InvalidTransition`] if `next` does not follow the current
    ///   state.
    pub fn advance(&self, id: &RequestId, next: IssuanceState) -> Result<StatusRecord> {
        self.transition(id, next, |_| {})
    }

    /// Moves a record to the terminal state described by `resolution`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::advance`].
    pub fn resolve(&self, id: &RequestId, resolution: Resolution) -> Result<StatusRecord> {
        let next = resolution.state();
        self.transition(id, next, move |record| {
            record.resolved_at = Some(now_millis());
            match resolution {
                Resolution::Issued(coupon_id) => record.coupon_id = Some(coupon_id),
                Resolution::Failed(reason) => record.reason = Some(reason),
                Resolution::SoldOut => record.reason = Some("stock exhausted".to_string()),
            }
        })
    }

    fn transition(
        &self,
        id: &RequestId,
        next: IssuanceState,
        apply: impl FnOnce(&mut StatusRecord),
    ) -> Result<StatusRecord> {
        let shard = self.shard(id);
        let updated = {
            let mut entries = shard.entries.write();
            let entry = entries
                .get_mut(id)
                .ok_or_else(|| Error::RequestNotFound(id.clone()))?;

            let from = entry.record.state;
            if !from.can_advance_to(next) {
                return Err(Error::InvalidTransition {
                    request_id: id.clone(),
                    from,
                    to: next,
                });
            }

            entry.record.state = next;
            apply(&mut entry.record);
            if next.is_terminal() {
                entry.resolved = Some(Instant::now());
            }
            entry.record.clone()
        };

        if next.is_terminal() {
            shard.resolved.notify_waiters();
        }
        Ok(updated)
    }

    pub fn remove(&self, id: &RequestId) -> Option<StatusRecord> {
        self.shard(id)
            .entries
            .write()
            .remove(id)
            .map(|entry| entry.record)
    }

    /// Drops terminal records older than the retention TTL. Non-terminal
    /// records are never purged. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| {
                let mut entries = shard.entries.write();
                let before = entries.len();
                entries.retain(|_, entry| !self.is_expired(entry, now));
                before - entries.len()
            })
            .sum()
    }

    /// Waits up to `max_wait` for `id` to reach a terminal state and returns
    /// the latest record either way. `None` if the id is unknown.
    pub async fn wait_terminal(&self, id: &RequestId, max_wait: Duration) -> Option<StatusRecord> {
        let shard = self.shard(id);
        let deadline = Instant::now() + max_wait;

        loop {
            let mut notified = pin!(shard.resolved.notified());
            // Register before reading so a write between the read and the
            // await is not missed.
            notified.as_mut().enable();

            let record = self.get(id)?;
            if record.state.is_terminal() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Some(record);
            }
        }
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.entries.read().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
