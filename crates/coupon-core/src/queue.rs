//! Bounded, partitioned request queue between admission and dispatch.
//!
//! The queue is split into partitions, each backed by a bounded
//! [`mpsc`] channel and drained by exactly one [`QueueConsumer`]. A campaign
//! always hashes to the same partition, so requests for one campaign are
//! attempted in the order they were enqueued. No ordering is promised across
//! campaigns.
//!
//! ## Backpressure
//!
//! [`RequestQueue::enqueue`] never waits. A request is rejected with
//! [`Error::Overloaded`] when either its campaign already has
//! `max_depth` queued requests, or its partition channel is full. The
//! caller is expected to retry with backoff.
//!
//! ## Accounting
//!
//! Each campaign has a [`Lane`] counting queued and processing requests. A
//! dequeued request is handed out as a [`ClaimedRequest`], which keeps the
//! processing count raised until it is dropped.
//!
//! Each lane also carries an admission gate. [`RequestQueue::enqueue`] holds it
//! while placing a request, and [`RequestQueue::with_idle_lane`] holds it while
//! it runs work that must see the campaign idle, such as a stock reset.

use crate::{
    Error, Result,
    types::{CampaignId, Millis, RequestId, RequesterId},
};
use core::time::Duration;
use parking_lot::{Mutex, RwLock};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};

/// One user's attempt to obtain one unit of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceRequest {
    pub request_id: RequestId,
    pub campaign_id: CampaignId,
    pub requester_id: RequesterId,
    pub submitted_at: Millis,
}

/// A message carried by a partition channel.
#[derive(Debug)]
pub enum QueueMessage {
    Issue(IssuanceRequest),
    /// Sent after all queued work; the consumer acknowledges and stops.
    Shutdown { response: oneshot::Sender<()> },
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub partitions: usize,
    /// Capacity of each partition channel.
    pub partition_buffer: usize,
    /// Maximum queued requests per campaign.
    pub max_depth: usize,
    /// Bounded wait for [`QueueConsumer::dequeue`] on an empty partition.
    pub dequeue_timeout: Duration,
    /// Hint surfaced with overload rejections.
    pub retry_after_secs: u64,
}

#[derive(Default)]
struct Lane {
    queued: AtomicUsize,
    processing: AtomicUsize,
    gate: Mutex<()>,
}

impl Lane {
    fn in_flight(&self) -> usize {
        self.queued.load(Ordering::Acquire) + self.processing.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Lanes {
    lanes: RwLock<HashMap<CampaignId, Arc<Lane>>>,
}

impl Lanes {
    fn get(&self, campaign: CampaignId) -> Option<Arc<Lane>> {
        self.lanes.read().get(&campaign).cloned()
    }

    fn get_or_create(&self, campaign: CampaignId) -> Arc<Lane> {
        if let Some(lane) = self.get(campaign) {
            return lane;
        }
        Arc::clone(self.lanes.write().entry(campaign).or_default())
    }

    fn sum(&self, f: impl Fn(&Lane) -> usize) -> usize {
        self.lanes.read().values().map(|lane| f(lane.as_ref())).sum()
    }
}

pub struct RequestQueue {
    partitions: Vec<mpsc::Sender<QueueMessage>>,
    lanes: Arc<Lanes>,
    max_depth: usize,
    retry_after_secs: u64,
    closed: AtomicBool,
}

impl RequestQueue {
    /// Builds the queue and one consumer per partition.
    ///
    /// # Panics
    ///
    /// Panics if `partitions` or `partition_buffer` is zero; configuration
    /// validation rejects both before this is reached.
    pub fn new(config: &QueueConfig) -> (Self, Vec<QueueConsumer>) {
        assert!(config.partitions > 0, "queue needs at least one partition");

        let lanes = Arc::new(Lanes::default());
        let mut partitions = Vec::with_capacity(config.partitions);
        let mut consumers = Vec::with_capacity(config.partitions);

        for partition in 0..config.partitions {
            let (tx, rx) = mpsc::channel(config.partition_buffer);
            partitions.push(tx);
            consumers.push(QueueConsumer {
                partition,
                rx,
                lanes: Arc::clone(&lanes),
                dequeue_timeout: config.dequeue_timeout,
            });
        }

        let queue = Self {
            partitions,
            lanes,
            max_depth: config.max_depth,
            retry_after_secs: config.retry_after_secs,
            closed: AtomicBool::new(false),
        };
        (queue, consumers)
    }

    pub fn partition_of(&self, campaign: CampaignId) -> usize {
        (campaign.0 % self.partitions.len() as u64) as usize
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Places a request at the tail of its campaign's partition without
    /// waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::Overloaded`] if the campaign or partition is at capacity.
    /// - [`Error::ServiceShutdown`] once the queue is closed.
    pub fn enqueue(&self, request: IssuanceRequest) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ServiceShutdown);
        }

        let campaign = request.campaign_id;
        let lane = self.lanes.get_or_create(campaign);
        let max_depth = self.max_depth;
        let _gate = lane.gate.lock();

        // Claim a depth slot before the send so a consumer can never observe
        // the request without its slot.
        if lane
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < max_depth).then_some(queued + 1)
            })
            .is_err()
        {
            return Err(self.overloaded(format!(
                "campaign {campaign} has {max_depth} queued requests"
            )));
        }

        let partition = self.partition_of(campaign);
        match self.partitions[partition].try_send(QueueMessage::Issue(request)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                lane.queued.fetch_sub(1, Ordering::AcqRel);
                Err(self.overloaded(format!("partition {partition} is full")))
            }
            Err(TrySendError::Closed(_)) => {
                lane.queued.fetch_sub(1, Ordering::AcqRel);
                Err(Error::ServiceShutdown)
            }
        }
    }

    fn overloaded(&self, details: String) -> Error {
        Error::Overloaded {
            details,
            retry_after_secs: self.retry_after_secs,
        }
    }

    /// Stops accepting new requests. Already queued requests stay queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a shutdown marker behind every request already queued on
    /// `partition`. The returned receiver resolves once the consumer stops.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the partition's consumer is gone.
    pub async fn send_shutdown(&self, partition: usize) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.partitions[partition]
            .send(QueueMessage::Shutdown { response: tx })
            .await
            .map_err(|e| Error::Internal {
                context: format!("partition {partition} consumer closed: {e}"),
            })?;
        Ok(rx)
    }

    /// Requests waiting in the queue for `campaign`.
    pub fn depth(&self, campaign: CampaignId) -> usize {
        self.lanes
            .get(campaign)
            .map_or(0, |lane| lane.queued.load(Ordering::Acquire))
    }

    /// Requests for `campaign` that are queued or currently being processed.
    pub fn in_flight(&self, campaign: CampaignId) -> usize {
        self.lanes.get(campaign).map_or(0, |lane| lane.in_flight())
    }

    /// Runs `f` only if nothing for `campaign` is queued or processing, and
    /// keeps new requests for it out until `f` returns.
    ///
    /// A request must be enqueued before a worker can claim it, so once the
    /// gate is held and the lane reads idle, no attempt for the campaign can
    /// start until the gate is released.
    ///
    /// # Errors
    ///
    /// Returns the in-flight count, without running `f`, when the campaign is
    /// busy.
    pub fn with_idle_lane<R>(
        &self,
        campaign: CampaignId,
        f: impl FnOnce() -> R,
    ) -> core::result::Result<R, usize> {
        let lane = self.lanes.get_or_create(campaign);
        let _gate = lane.gate.lock();
        match lane.in_flight() {
            0 => Ok(f()),
            busy => Err(busy),
        }
    }

    pub fn total_depth(&self) -> usize {
        self.lanes.sum(|lane| lane.queued.load(Ordering::Acquire))
    }

    pub fn total_in_flight(&self) -> usize {
        self.lanes.sum(Lane::in_flight)
    }
}

/// A request taken off the queue. Counts as processing until dropped.
pub struct ClaimedRequest {
    request: IssuanceRequest,
    lane: Arc<Lane>,
}

impl ClaimedRequest {
    pub fn request(&self) -> &IssuanceRequest {
        &self.request
    }
}

impl Drop for ClaimedRequest {
    fn drop(&mut self) {
        self.lane.processing.fetch_sub(1, Ordering::AcqRel);
    }
}

pub enum Dequeued {
    Request(ClaimedRequest),
    Shutdown(oneshot::Sender<()>),
    /// Nothing arrived within the dequeue timeout.
    Empty,
    /// Every sender is gone.
    Closed,
}

/// Receiving end of one partition.
pub struct QueueConsumer {
    partition: usize,
    rx: mpsc::Receiver<QueueMessage>,
    lanes: Arc<Lanes>,
    dequeue_timeout: Duration,
}

impl QueueConsumer {
    pub const fn partition(&self) -> usize {
        self.partition
    }

    /// Takes the next message, waiting at most the configured timeout.
    pub async fn dequeue(&mut self) -> Dequeued {
        match tokio::time::timeout(self.dequeue_timeout, self.rx.recv()).await {
            Err(_) => Dequeued::Empty,
            Ok(None) => Dequeued::Closed,
            Ok(Some(QueueMessage::Shutdown { response })) => Dequeued::Shutdown(response),
            Ok(Some(QueueMessage::Issue(request))) => {
                let lane = self.lanes.get_or_create(request.campaign_id);
                // Raise processing before dropping queued so in-flight never
                // reads low in between.
                lane.processing.fetch_add(1, Ordering::AcqRel);
                lane.queued.fetch_sub(1, Ordering::AcqRel);
                Dequeued::Request(ClaimedRequest { request, lane })
            }
        }
    }
}
