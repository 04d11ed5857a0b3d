//! Coupon issuance service.
//!
//! This module defines [`CouponService`], the single entry point used by the
//! HTTP layer. It owns the worker pool and the shared stores, and implements
//! every operation the API exposes.
//!
//! ## Responsibilities
//!
//! - Admit issuance requests: validate the campaign, deduplicate per
//!   requester, and enqueue without ever touching the stock ledger.
//! - Answer status, stock and campaign queries.
//! - Reset stock, register campaigns and redeem coupons.
//! - Purge expired status records in the background.
//! - Coordinate graceful shutdown with the worker pool.

use crate::server::{
    config::ServerConfig,
    pool::manager::WorkerPool,
    service::stores::Stores,
    telemetry::{increment_admissions, increment_overloads, record_outcome, record_queue_depth},
};
use core::time::Duration;
use coupon_core::{
    Error, Result,
    campaign::{Campaign, CampaignCatalog, CampaignSpec},
    coupon::{CouponBook, IssuedCoupon},
    ids::IdMint,
    ledger::StockLedger,
    queue::{IssuanceRequest, QueueConfig, RequestQueue},
    status::{StatusRecord, StatusStore},
    tickets::TicketIndex,
    types::{CampaignId, IssuanceState, RequestId, RequesterId, now_millis},
    wire::{
        AvailableCampaign, Health, IssueRequest, IssueResponse, RedeemRequest, RedeemResponse,
        ResetResponse, StockResponse, SystemStatus, ValidateRequest, ValidateResponse,
    },
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How an admission was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new or still-pending request; poll its status.
    Queued(IssueResponse),
    /// Already terminal: a previous win, or a sold-out short-circuit.
    Resolved(IssueResponse),
}

impl Admission {
    pub const fn response(&self) -> &IssueResponse {
        match self {
            Self::Queued(response) | Self::Resolved(response) => response,
        }
    }
}

#[derive(Clone)]
pub struct CouponService {
    config: Arc<ServerConfig>,
    stores: Arc<Stores>,
    worker_pool: Arc<WorkerPool>,
    sweeper_token: CancellationToken,
}

impl CouponService {
    /// Builds the stores, registers seeded campaigns, and spawns the worker
    /// pool and status sweeper. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a seeded campaign is invalid.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let stores = Arc::new(Stores {
            catalog: CampaignCatalog::new(),
            ledger: StockLedger::new(),
            coupons: CouponBook::new(),
            status: StatusStore::new(config.store_shards, config.status_ttl),
            tickets: TicketIndex::new(config.store_shards),
            ids: IdMint::new(config.machine_id),
        });

        let (queue, consumers) = RequestQueue::new(&QueueConfig {
            partitions: config.num_workers,
            partition_buffer: config.partition_buffer,
            max_depth: config.max_queue_depth,
            dequeue_timeout: config.dequeue_timeout,
            retry_after_secs: config.retry_after_secs,
        });
        let worker_pool = WorkerPool::spawn(
            Arc::new(queue),
            consumers,
            &stores,
            config.shutdown_timeout,
        );

        let sweeper_token = CancellationToken::new();
        tokio::spawn(sweep_loop(
            Arc::clone(&stores),
            config.sweep_interval,
            sweeper_token.clone(),
        ));

        let service = Self {
            config: Arc::new(config),
            stores,
            worker_pool: Arc::new(worker_pool),
            sweeper_token,
        };

        for &(campaign_id, total) in &service.config.seed_campaigns {
            let spec = CampaignSpec::seeded(campaign_id, total, service.config.default_discount);
            service.register_campaign(spec)?;
        }

        Ok(service)
    }

    /// Admits one issuance request.
    ///
    /// Never mutates the stock ledger. The duplicate check, ticket creation and
    /// enqueue all happen under the requester's ticket lock, so concurrent
    /// requests from one requester for one campaign yield a single ticket.
    ///
    /// # Errors
    ///
    /// - [`Error::CampaignNotFound`] / [`Error::CampaignInactive`].
    /// - [`Error::Overloaded`] when the campaign queue is full.
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    #[tracing::instrument(skip_all, fields(campaign = %req.campaign_id, requester = %req.requester_id))]
    pub fn issue(&self, req: IssueRequest) -> Result<Admission> {
        if self.worker_pool.is_shutting_down() {
            return Err(Error::ServiceShutdown);
        }

        let IssueRequest {
            requester_id,
            campaign_id,
        } = req;
        let now = now_millis();
        let campaign = self.stores.catalog.get(campaign_id)?;
        campaign.ensure_active(now)?;
        increment_admissions();

        if let Some(coupon) = self.stores.coupons.owned(requester_id, campaign_id) {
            return Ok(Admission::Resolved(IssueResponse {
                request_id: coupon.request_id,
                state: IssuanceState::Issued,
                coupon_id: Some(coupon.coupon_id),
            }));
        }

        let mut ticket = self.stores.tickets.lock(requester_id, campaign_id);
        if let Some(existing) = ticket.current().and_then(|id| self.stores.status.get(id)) {
            if existing.state.blocks_readmission() {
                tracing::debug!(request_id = %existing.request_id, "Returning existing ticket");
                let response = IssueResponse {
                    request_id: existing.request_id,
                    state: existing.state,
                    coupon_id: existing.coupon_id,
                };
                return Ok(if existing.state.is_terminal() {
                    Admission::Resolved(response)
                } else {
                    Admission::Queued(response)
                });
            }
        }

        let request_id = self.stores.ids.next_request_id()?;
        let mut record = StatusRecord::pending(request_id.clone(), campaign_id, requester_id, now);

        // Remaining stock never grows during issuance, so a zero now means a
        // queued attempt would also sell out.
        if self.stores.ledger.peek(campaign_id) == Some(0) {
            record.state = IssuanceState::SoldOut;
            record.reason = Some("stock exhausted".to_string());
            record.resolved_at = Some(now);
            self.stores.status.put(record);
            ticket.set(request_id.clone());
            record_outcome(IssuanceState::SoldOut);
            tracing::debug!(request_id = %request_id, "Sold out at admission");
            return Ok(Admission::Resolved(IssueResponse {
                request_id,
                state: IssuanceState::SoldOut,
                coupon_id: None,
            }));
        }

        self.stores.status.put(record);
        ticket.set(request_id.clone());

        let submitted = self.worker_pool.submit(IssuanceRequest {
            request_id: request_id.clone(),
            campaign_id,
            requester_id,
            submitted_at: now,
        });
        if let Err(e) = submitted {
            self.stores.status.remove(&request_id);
            ticket.clear(&request_id);
            if matches!(e, Error::Overloaded { .. }) {
                increment_overloads();
                tracing::warn!("Admission rejected: {e}");
            }
            return Err(e);
        }

        record_queue_depth(self.worker_pool.queue().depth(campaign_id));
        tracing::debug!(request_id = %request_id, "Request queued");
        Ok(Admission::Queued(IssueResponse {
            request_id,
            state: IssuanceState::Pending,
            coupon_id: None,
        }))
    }

    /// Looks up a request. With `wait`, blocks up to that long (capped by
    /// `max_status_wait`) for the request to become terminal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestNotFound`] for unknown or expired ids.
    pub async fn status(&self, id: &RequestId, wait: Option<Duration>) -> Result<StatusRecord> {
        let record = match wait.filter(|wait| !wait.is_zero()) {
            Some(wait) => {
                let wait = wait.min(self.config.max_status_wait);
                self.stores.status.wait_terminal(id, wait).await
            }
            None => self.stores.status.get(id),
        };
        record.ok_or_else(|| Error::RequestNotFound(id.clone()))
    }

    /// # Errors
    ///
    /// Returns [`Error::CampaignNotFound`] for unknown campaigns.
    pub fn stock(&self, campaign_id: CampaignId) -> Result<StockResponse> {
        self.stores
            .ledger
            .snapshot(campaign_id)
            .map(|snapshot| StockResponse::new(campaign_id, snapshot))
            .ok_or(Error::CampaignNotFound(campaign_id))
    }

    /// Resets remaining stock to the campaign's configured total.
    ///
    /// # Errors
    ///
    /// - [`Error::CampaignNotFound`] for unknown campaigns.
    /// - [`Error::IssuanceInFlight`] while requests for the campaign are
    ///   queued or processing, unless live resets are allowed.
    pub fn initialize_stock(&self, campaign_id: CampaignId) -> Result<ResetResponse> {
        let campaign = self.stores.catalog.get(campaign_id)?;

        let reset = || self.stores.ledger.reset(campaign_id, campaign.total_stock);
        let snapshot = if self.config.allow_live_reset {
            reset()
        } else {
            self.worker_pool
                .queue()
                .with_idle_lane(campaign_id, reset)
                .map_err(|in_flight| Error::IssuanceInFlight {
                    campaign_id,
                    in_flight,
                })?
        };
        tracing::info!(
            campaign = %campaign_id,
            remaining = snapshot.remaining,
            "Stock reset"
        );
        Ok(ResetResponse {
            campaign_id,
            total: snapshot.total,
            remaining: snapshot.remaining,
        })
    }

    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if the spec does not validate.
    /// - [`Error::CampaignExists`] if the id is taken.
    pub fn register_campaign(&self, spec: CampaignSpec) -> Result<Arc<Campaign>> {
        let campaign = spec.build(now_millis(), self.config.default_discount)?;
        let campaign = self.stores.catalog.register(campaign)?;
        if !self.stores.ledger.register(campaign.id, campaign.total_stock) {
            // The catalog refuses duplicate ids, so the ledger should never
            // already hold one.
            tracing::error!(
                campaign = %campaign.id,
                "Ledger already had a counter for a newly registered campaign"
            );
            return Err(Error::Internal {
                context: format!("stock ledger already tracks campaign {}", campaign.id),
            });
        }
        tracing::info!(
            campaign = %campaign.id,
            total = campaign.total_stock,
            "Campaign registered"
        );
        Ok(campaign)
    }

    /// # Errors
    ///
    /// Returns [`Error::CampaignNotFound`] for unknown campaigns.
    pub fn campaign(&self, campaign_id: CampaignId) -> Result<Arc<Campaign>> {
        self.stores.catalog.get(campaign_id)
    }

    /// Campaigns that would admit an issuance request right now: inside their
    /// window and with stock left.
    pub fn available_campaigns(&self) -> Vec<AvailableCampaign> {
        let now = now_millis();
        self.stores
            .catalog
            .list()
            .into_iter()
            .filter(|campaign| campaign.ensure_active(now).is_ok())
            .filter_map(|campaign| {
                let remaining = self.stores.ledger.peek(campaign.id)?;
                (remaining > 0).then(|| AvailableCampaign {
                    campaign: Campaign::clone(&campaign),
                    remaining,
                })
            })
            .collect()
    }

    pub fn coupons_of(&self, requester_id: RequesterId) -> Vec<IssuedCoupon> {
        self.stores.coupons.list_for(requester_id)
    }

    /// Applies an owned coupon to an order.
    ///
    /// # Errors
    ///
    /// See [`CouponBook::redeem`].
    pub fn redeem(&self, req: RedeemRequest) -> Result<RedeemResponse> {
        let coupon = self.stores.coupons.get(&req.coupon_id)?;
        let campaign = self.stores.catalog.get(coupon.campaign_id)?;
        let redemption = self.stores.coupons.redeem(
            req.requester_id,
            &req.coupon_id,
            req.order_amount,
            req.order_id,
            &campaign,
            now_millis(),
        )?;
        tracing::info!(
            coupon_id = %redemption.coupon_id,
            discount = redemption.discount,
            "Coupon redeemed"
        );
        Ok(redemption.into())
    }

    /// Previews the discount an owned coupon would give an order, leaving the
    /// coupon unredeemed. Any reason the coupon cannot be used is reported in
    /// the response.
    pub fn validate(&self, req: ValidateRequest) -> ValidateResponse {
        let preview = self.stores.coupons.get(&req.coupon_id).and_then(|coupon| {
            let campaign = self.stores.catalog.get(coupon.campaign_id)?;
            self.stores.coupons.validate(
                req.requester_id,
                &req.coupon_id,
                req.order_amount,
                &campaign,
                now_millis(),
            )
        });

        match preview {
            Ok(redemption) => ValidateResponse::usable(req.requester_id, redemption),
            Err(e) => {
                tracing::debug!(coupon_id = %req.coupon_id, "Coupon not usable: {e}");
                ValidateResponse::unusable(req, e.to_string())
            }
        }
    }

    pub fn system_status(&self) -> SystemStatus {
        let queue = self.worker_pool.queue();
        SystemStatus {
            queue_depth: queue.total_depth(),
            in_flight: queue.total_in_flight(),
            workers: self.worker_pool.worker_count(),
            campaigns: self.stores.catalog.len(),
            tracked_requests: self.stores.status.len(),
            issued_coupons: self.stores.coupons.len(),
            health: if self.is_serving() {
                Health::Serving
            } else {
                Health::ShuttingDown
            },
        }
    }

    pub fn is_serving(&self) -> bool {
        !self.worker_pool.is_shutting_down()
    }

    /// Stops the sweeper and shuts the worker pool down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.sweeper_token.cancel();
        self.worker_pool.shutdown().await
    }

    #[cfg(test)]
    pub(crate) fn stores(&self) -> &Stores {
        &self.stores
    }
}

/// Periodically purges expired status records and the tickets pointing at
/// them.
async fn sweep_loop(stores: Arc<Stores>, every: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {
                let purged = stores.status.purge_expired();
                let pruned = stores.tickets.prune(|id| stores.status.contains(id));
                if purged > 0 || pruned > 0 {
                    tracing::debug!(purged, pruned, "Swept expired status records");
                }
            }
        }
    }

    tracing::trace!("Status sweeper stopped");
}
