//! Queue-driven sync worker.
//!
//! Dequeues one task at a time, pays the rate-limiter toll for the two
//! sheet reads a sync performs, runs the crawler, and acks. Failed
//! attempts are re-enqueued up to the retry cap; the crawler has already
//! emitted the user-facing `sync:failed` for the attempt, so exhausting
//! retries only logs.

use super::crawler::{CrawlerService, SyncReport};
use super::queue::{Delivery, SyncQueue};
use super::SyncTask;
use crate::errors::SheetmindError;
use crate::limiter::RateLimiter;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Sheet reads per sync: one metadata fetch plus one values fetch.
const REQUESTS_PER_SYNC: f64 = 2.0;
const MAX_RETRIES: u32 = 3;

pub struct SyncWorker {
    queue: Arc<dyn SyncQueue>,
    limiter: Arc<RateLimiter>,
    crawler: Arc<CrawlerService>,
    /// Per-connection serialization, even if the scheduler misbehaves and
    /// enqueues duplicates.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncWorker {
    pub fn new(
        queue: Arc<dyn SyncQueue>,
        limiter: Arc<RateLimiter>,
        crawler: Arc<CrawlerService>,
    ) -> Self {
        Self {
            queue,
            limiter,
            crawler,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Consume the queue until it closes. Run one of these per worker
    /// task; the per-connection lock keeps concurrent workers safe.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("sync worker started");
        loop {
            let delivery = match self.queue.dequeue().await {
                Ok(delivery) => delivery,
                Err(e) => {
                    info!("sync queue closed, worker stopping: {e}");
                    return Ok(());
                }
            };
            self.process(delivery).await;
        }
    }

    /// Like [`Self::run`], but stops between tasks when `shutdown` flips.
    /// An in-flight sync always runs to completion or failure.
    pub async fn run_until(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        info!("sync worker started");
        loop {
            let delivery = tokio::select! {
                delivery = self.queue.dequeue() => match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        info!("sync queue closed, worker stopping: {e}");
                        return Ok(());
                    }
                },
                _ = shutdown.changed() => {
                    info!("sync worker draining on shutdown");
                    return Ok(());
                }
            };
            self.process(delivery).await;
        }
    }

    /// Handle exactly one delivery. Split from [`Self::run`] for tests.
    pub async fn process(&self, delivery: Delivery) {
        let Delivery { task, receipt } = delivery;
        let lock = self.connection_lock(&task.connection_id);
        let _guard = lock.lock().await;

        debug!(
            "processing sync task for {} (retry {})",
            task.connection_id, task.retry_count
        );
        self.limiter.acquire(REQUESTS_PER_SYNC).await;

        match self.crawler.sync(&task.connection_id).await {
            Ok(SyncReport::Skipped) => {
                debug!("connection {} disabled, dropping task", task.connection_id);
            }
            Ok(SyncReport::Completed { rows_synced, .. }) => {
                debug!(
                    "sync task done for {}: {rows_synced} rows",
                    task.connection_id
                );
            }
            Err(SheetmindError::NotFound(_)) => {
                // The connection was deleted after the task was enqueued.
                debug!("connection {} gone, dropping task", task.connection_id);
            }
            Err(e) => self.handle_failure(&task, &e).await,
        }

        if let Err(e) = self.queue.ack(&receipt).await {
            warn!("failed to ack sync task for {}: {e}", task.connection_id);
        }
    }

    async fn handle_failure(&self, task: &SyncTask, error: &SheetmindError) {
        if error.is_retryable() && task.retry_count < MAX_RETRIES {
            let retry = task.retry();
            warn!(
                "sync failed for {} (attempt {}), re-enqueueing: {error}",
                task.connection_id,
                task.retry_count + 1
            );
            if let Err(e) = self.queue.enqueue(retry).await {
                error!(
                    "could not re-enqueue sync for {}: {e}",
                    task.connection_id
                );
            }
        } else {
            // The crawler emitted the terminal sync:failed for this attempt.
            error!(
                "sync permanently failed for {} after {} attempts: {error}",
                task.connection_id,
                task.retry_count + 1
            );
        }
    }

    fn connection_lock(&self, connection_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(connection_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests;
