use crate::server::{
    service::stores::Stores,
    telemetry::{record_dispatch_duration, record_outcome},
};
use coupon_core::{
    queue::{Dequeued, IssuanceRequest, QueueConsumer},
    status::Resolution,
    types::{IssuanceState, now_millis},
};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Worker task draining one queue partition.
///
/// Requests are resolved one at a time in dequeue order, which keeps attempts
/// for a campaign in FIFO order. The loop exits on a shutdown marker or when
/// the queue is dropped.
///
/// # Arguments
///
/// - `consumer`: Receiving end of the partition this worker owns.
/// - `stores`: Shared campaign, stock, coupon and status stores.
/// - `shutdown_token`: Once cancelled, requests still queued are resolved as
///   `FAILED` instead of attempted.
pub async fn worker_loop(
    mut consumer: QueueConsumer,
    stores: Arc<Stores>,
    shutdown_token: CancellationToken,
) {
    let worker_id = consumer.partition();
    tracing::trace!("Worker {worker_id} started");

    loop {
        match consumer.dequeue().await {
            Dequeued::Request(claimed) => {
                if shutdown_token.is_cancelled() {
                    abandon(worker_id, &stores, claimed.request());
                } else {
                    dispatch(worker_id, &stores, claimed.request());
                }
            }
            Dequeued::Empty => {}
            Dequeued::Shutdown(response) => {
                tracing::debug!("Worker {worker_id} received shutdown signal");
                if response.send(()).is_err() {
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
            Dequeued::Closed => break,
        }
    }

    tracing::trace!("Worker {worker_id} stopped");
}

/// Runs one request through `PROCESSING` to a terminal state.
///
/// Each request id is attempted at most once: if the `PROCESSING` transition
/// is refused, the request was already handled and is skipped.
fn dispatch(worker_id: usize, stores: &Stores, request: &IssuanceRequest) {
    let started = Instant::now();
    let id = &request.request_id;

    if let Err(e) = stores.status.advance(id, IssuanceState::Processing) {
        tracing::warn!(worker_id, request_id = %id, "Skipping request: {e}");
        return;
    }

    let resolution = attempt(stores, request);
    match &resolution {
        Resolution::Issued(coupon_id) => {
            record_outcome(IssuanceState::Issued);
            tracing::debug!(
                worker_id,
                request_id = %id,
                campaign = %request.campaign_id,
                requester = %request.requester_id,
                coupon_id = %coupon_id,
                "Coupon issued"
            );
        }
        Resolution::SoldOut => {
            record_outcome(IssuanceState::SoldOut);
            tracing::debug!(
                worker_id,
                request_id = %id,
                campaign = %request.campaign_id,
                "Campaign sold out"
            );
        }
        Resolution::Failed(reason) => {
            record_outcome(IssuanceState::Failed);
            tracing::error!(
                worker_id,
                request_id = %id,
                campaign = %request.campaign_id,
                "Issuance failed: {reason}"
            );
        }
    }

    if let Err(e) = stores.status.resolve(id, resolution) {
        tracing::error!(worker_id, request_id = %id, "Failed to record outcome: {e}");
    }
    record_dispatch_duration(started.elapsed().as_secs_f64() * 1_000.0);
}

fn attempt(stores: &Stores, request: &IssuanceRequest) -> Resolution {
    let now = now_millis();
    let campaign = match stores
        .catalog
        .get(request.campaign_id)
        .and_then(|campaign| campaign.ensure_active(now).map(|()| campaign))
    {
        Ok(campaign) => campaign,
        Err(e) => return Resolution::Failed(e.to_string()),
    };

    if !stores.ledger.try_reserve(campaign.id) {
        return Resolution::SoldOut;
    }

    let recorded = stores.ids.next_coupon_id().and_then(|coupon_id| {
        stores.coupons.issue(
            coupon_id,
            campaign.id,
            request.requester_id,
            request.request_id.clone(),
            now,
        )
    });

    match recorded {
        Ok(coupon) => Resolution::Issued(coupon.coupon_id),
        Err(e) => {
            // Reserved but never recorded: return the unit.
            stores.ledger.restore(campaign.id);
            Resolution::Failed(e.to_string())
        }
    }
}

/// Resolves a request that was still queued when shutdown cancelled work.
fn abandon(worker_id: usize, stores: &Stores, request: &IssuanceRequest) {
    let id = &request.request_id;
    if stores
        .status
        .advance(id, IssuanceState::Processing)
        .and_then(|_| {
            stores
                .status
                .resolve(id, Resolution::Failed("service shutting down".to_string()))
        })
        .is_ok()
    {
        record_outcome(IssuanceState::Failed);
        tracing::warn!(worker_id, request_id = %id, "Request abandoned during shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use coupon_core::{
        campaign::{ActiveWindow, CampaignCatalog, CampaignSpec},
        coupon::CouponBook,
        ids::IdMint,
        ledger::StockLedger,
        queue::{QueueConfig, RequestQueue},
        status::{StatusRecord, StatusStore},
        tickets::TicketIndex,
        types::{CampaignId, CouponId, RequestId, RequesterId},
    };

    const CAMPAIGN: CampaignId = CampaignId(1);

    fn stores_with(spec: CampaignSpec) -> Arc<Stores> {
        let stores = Stores {
            catalog: CampaignCatalog::new(),
            ledger: StockLedger::new(),
            coupons: CouponBook::new(),
            status: StatusStore::new(4, Duration::from_secs(60)),
            tickets: TicketIndex::new(4),
            ids: IdMint::new(1),
        };
        let campaign = spec.build(now_millis(), 1_000).unwrap();
        stores.ledger.register(campaign.id, campaign.total_stock);
        stores.catalog.register(campaign).unwrap();
        Arc::new(stores)
    }

    fn stores(total: u64) -> Arc<Stores> {
        stores_with(CampaignSpec::seeded(CAMPAIGN, total, 1_000))
    }

    fn partition() -> (RequestQueue, QueueConsumer) {
        let (queue, mut consumers) = RequestQueue::new(&QueueConfig {
            partitions: 1,
            partition_buffer: 32,
            max_depth: 32,
            dequeue_timeout: Duration::from_millis(20),
            retry_after_secs: 1,
        });
        (queue, consumers.remove(0))
    }

    /// Records a PENDING request and queues it, as admission would.
    fn admit(stores: &Stores, queue: &RequestQueue, requester: u64) -> RequestId {
        let request_id = RequestId::from(format!("req-{requester}"));
        let now = now_millis();
        stores.status.put(StatusRecord::pending(
            request_id.clone(),
            CAMPAIGN,
            RequesterId(requester),
            now,
        ));
        queue
            .enqueue(IssuanceRequest {
                request_id: request_id.clone(),
                campaign_id: CAMPAIGN,
                requester_id: RequesterId(requester),
                submitted_at: now,
            })
            .unwrap();
        request_id
    }

    /// Queues the shutdown marker and runs the worker until it acknowledges.
    async fn run_to_shutdown(
        queue: &RequestQueue,
        consumer: QueueConsumer,
        stores: &Arc<Stores>,
        token: CancellationToken,
    ) {
        let ack = queue.send_shutdown(0).await.unwrap();
        worker_loop(consumer, Arc::clone(stores), token).await;
        ack.await.unwrap();
    }

    #[tokio::test]
    async fn drains_queue_in_order_until_stock_runs_out() {
        let stores = stores(2);
        let (queue, consumer) = partition();
        let ids: Vec<_> = (0..4).map(|n| admit(&stores, &queue, n)).collect();

        run_to_shutdown(&queue, consumer, &stores, CancellationToken::new()).await;

        let states: Vec<_> = ids
            .iter()
            .map(|id| stores.status.get(id).unwrap().state)
            .collect();
        assert_eq!(
            states,
            [
                IssuanceState::Issued,
                IssuanceState::Issued,
                IssuanceState::SoldOut,
                IssuanceState::SoldOut
            ]
        );
        assert_eq!(queue.in_flight(CAMPAIGN), 0);
    }

    #[tokio::test]
    async fn cancelled_worker_fails_queued_requests_without_touching_stock() {
        let stores = stores(5);
        let (queue, consumer) = partition();
        let ids: Vec<_> = (0..6).map(|n| admit(&stores, &queue, n)).collect();

        let token = CancellationToken::new();
        token.cancel();
        run_to_shutdown(&queue, consumer, &stores, token).await;

        for id in &ids {
            let record = stores.status.get(id).unwrap();
            assert_eq!(record.state, IssuanceState::Failed);
            assert_eq!(record.reason.as_deref(), Some("service shutting down"));
        }
        assert_eq!(stores.ledger.peek(CAMPAIGN), Some(5));
        assert!(stores.coupons.is_empty());
    }

    #[tokio::test]
    async fn unrecordable_coupon_returns_its_unit() {
        let stores = stores(3);

        // Requester 7 already won a unit through an earlier request.
        assert!(stores.ledger.try_reserve(CAMPAIGN));
        stores
            .coupons
            .issue(
                CouponId::from("earlier"),
                CAMPAIGN,
                RequesterId(7),
                RequestId::from("req-earlier"),
                now_millis(),
            )
            .unwrap();

        let (queue, consumer) = partition();
        let id = admit(&stores, &queue, 7);
        run_to_shutdown(&queue, consumer, &stores, CancellationToken::new()).await;

        let record = stores.status.get(&id).unwrap();
        assert_eq!(record.state, IssuanceState::Failed);
        assert!(record.coupon_id.is_none());

        let snapshot = stores.ledger.snapshot(CAMPAIGN).unwrap();
        assert_eq!(snapshot.remaining, 2);
        assert_eq!(
            stores.coupons.count_for(CAMPAIGN),
            snapshot.total - snapshot.remaining
        );
    }

    #[tokio::test]
    async fn window_closing_before_dispatch_fails_the_request() {
        let mut spec = CampaignSpec::seeded(CAMPAIGN, 5, 1_000);
        spec.window = ActiveWindow {
            starts_at: None,
            ends_at: Some(now_millis() + 30),
        };
        let stores = stores_with(spec);
        let (queue, consumer) = partition();
        let id = admit(&stores, &queue, 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        run_to_shutdown(&queue, consumer, &stores, CancellationToken::new()).await;

        let record = stores.status.get(&id).unwrap();
        assert_eq!(record.state, IssuanceState::Failed);
        assert!(
            record.reason.as_deref().is_some_and(|r| r.contains("not active")),
            "{record:?}"
        );
        assert_eq!(stores.ledger.peek(CAMPAIGN), Some(5));
        assert_eq!(stores.coupons.count_for(CAMPAIGN), 0);
    }
}
