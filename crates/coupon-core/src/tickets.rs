//! (requester, campaign) → most recent request id.
//!
//! Admission holds a [`TicketGuard`] for the whole check-then-create sequence,
//! so two concurrent requests from one requester for one campaign can never
//! both mint a ticket. Guards are synchronous and must not be held across an
//! `.await`.

use crate::types::{CampaignId, RequestId, RequesterId};
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
};

type Key = (RequesterId, CampaignId);

pub struct TicketIndex {
    shards: Box<[Mutex<HashMap<Key, RequestId>>]>,
}

impl TicketIndex {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    /// Locks the shard owning `(requester, campaign)`.
    pub fn lock(&self, requester: RequesterId, campaign: CampaignId) -> TicketGuard<'_> {
        let key = (requester, campaign);
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let shard = &self.shards[(hasher.finish() % self.shards.len() as u64) as usize];
        TicketGuard {
            shard: shard.lock(),
            key,
        }
    }

    /// Drops tickets whose request id no longer satisfies `keep`.
    pub fn prune(&self, mut keep: impl FnMut(&RequestId) -> bool) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.lock();
                let before = shard.len();
                shard.retain(|_, id| keep(id));
                before - shard.len()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct TicketGuard<'a> {
    shard: MutexGuard<'a, HashMap<Key, RequestId>>,
    key: Key,
}

impl TicketGuard<'_> {
    pub fn current(&self) -> Option<&RequestId> {
        self.shard.get(&self.key)
    }

    pub fn set(&mut self, id: RequestId) {
        self.shard.insert(self.key, id);
    }

    /// Removes the ticket only if it still points at `id`.
    pub fn clear(&mut self, id: &RequestId) {
        if self.shard.get(&self.key) == Some(id) {
            self.shard.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_lifecycle() {
        let index = TicketIndex::new(8);
        let (requester, campaign) = (RequesterId(1), CampaignId(2));

        {
            let mut ticket = index.lock(requester, campaign);
            assert!(ticket.current().is_none());
            ticket.set(RequestId::from("a"));
        }
        {
            let mut ticket = index.lock(requester, campaign);
            assert_eq!(ticket.current(), Some(&RequestId::from("a")));
            ticket.clear(&RequestId::from("b"));
            assert!(ticket.current().is_some());
            ticket.clear(&RequestId::from("a"));
            assert!(ticket.current().is_none());
        }
    }

    #[test]
    fn prune_drops_stale_tickets() {
        let index = TicketIndex::new(4);
        index.lock(RequesterId(1), CampaignId(1)).set(RequestId::from("keep"));
        index.lock(RequesterId(2), CampaignId(1)).set(RequestId::from("gone"));
        assert_eq!(index.prune(|id| id.as_str() == "keep"), 1);
        assert_eq!(index.len(), 1);
    }
}
