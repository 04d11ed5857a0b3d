//! Dispatcher worker pool.
//!
//! This module defines the [`WorkerPool`], which spawns one worker per queue
//! partition and is the only path by which admission places work on the
//! [`RequestQueue`]. Work is routed by campaign, not round-robin, so every
//! request for a campaign is handled by the same worker.
//!
//! Shutdown is cooperative: admission is refused first, queued work drains
//! for up to `shutdown_timeout`, anything left is abandoned through the shared
//! [`CancellationToken`], and finally each worker is told to stop.

use crate::server::{pool::worker::worker_loop, service::stores::Stores};
use core::time::Duration;
use coupon_core::{
    Error, Result,
    queue::{IssuanceRequest, QueueConsumer, RequestQueue},
};
use std::sync::Arc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Per-worker bound on sending the shutdown marker and on its acknowledgement.
const WORKER_ACK_TIMEOUT: Duration = Duration::from_secs(3);

pub struct WorkerPool {
    queue: Arc<RequestQueue>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawns one [`worker_loop`] per consumer. Must be called from within a
    /// Tokio runtime.
    pub fn spawn(
        queue: Arc<RequestQueue>,
        consumers: Vec<QueueConsumer>,
        stores: &Arc<Stores>,
        shutdown_timeout: Duration,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        for consumer in consumers {
            tokio::spawn(worker_loop(
                consumer,
                Arc::clone(stores),
                shutdown_token.clone(),
            ));
        }

        Self {
            queue,
            shutdown_token,
            shutdown_timeout,
        }
    }

    /// Places `request` on its campaign's partition without waiting.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] once shutdown has begun.
    /// - [`Error::Overloaded`] when the campaign or partition is full.
    pub fn submit(&self, request: IssuanceRequest) -> Result<()> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        self.queue.enqueue(request)
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub fn worker_count(&self) -> usize {
        self.queue.partition_count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.is_closed()
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Closes the queue so admission answers `503`.
    /// - Waits up to `shutdown_timeout` for queued and processing requests
    ///   to finish.
    /// - Cancels the shared token; workers resolve whatever is still queued
    ///   as `FAILED`.
    /// - Sends a shutdown marker to each worker and waits (up to 3 seconds
    ///   per worker) for acknowledgements.
    pub async fn shutdown(&self) -> Result<()> {
        // === Phase 0: Stop accepting new requests ===
        tracing::info!("Refusing new requests");
        self.queue.close();

        // === Phase 1: Let queued work drain ===
        tracing::info!(
            "Draining queued requests ({} in flight)",
            self.queue.total_in_flight()
        );
        let drained = timeout(self.shutdown_timeout, async {
            while self.queue.total_in_flight() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All queued requests drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} requests still in flight)",
                self.queue.total_in_flight()
            ),
        }

        // === Phase 2: Abandon remaining work ===
        tracing::debug!("Cancelling remaining work via shutdown token");
        self.shutdown_token.cancel();

        // === Phase 3: Notify workers to shut down ===
        tracing::debug!("Notifying all workers to shut down");
        let mut acks = Vec::with_capacity(self.worker_count());
        for partition in 0..self.worker_count() {
            match timeout(WORKER_ACK_TIMEOUT, self.queue.send_shutdown(partition)).await {
                Ok(Ok(rx)) => acks.push((partition, rx)),
                Ok(Err(e)) => {
                    tracing::error!("Failed to send shutdown to worker {partition}: {e}");
                }
                Err(_) => tracing::warn!("Worker {partition} did not accept shutdown"),
            }
        }

        let waits = acks.into_iter().map(|(partition, rx)| async move {
            match timeout(WORKER_ACK_TIMEOUT, rx).await {
                Ok(Ok(())) => tracing::trace!("Worker {partition} shutdown acknowledged"),
                Ok(Err(e)) => tracing::error!("Worker {partition} returned error: {e}"),
                Err(_) => tracing::warn!("Worker {partition} shutdown timed out"),
            }
        });
        futures::future::join_all(waits).await;

        tracing::info!("Worker pool shutdown complete");
        Ok(())
    }
}
