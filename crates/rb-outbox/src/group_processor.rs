//! Per-group FIFO worker.
//!
//! One worker owns the queue of a single `(type, message group)` key and
//! moves through a small state machine: collect a batch, take one permit
//! from the global semaphore, submit the batch, write the per-item statuses
//! back, release the permit. Batches of one group never overlap, which is
//! the whole FIFO guarantee; the permit caps how many batches are on the
//! wire across all groups.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use rb_common::{OutboxItem, OutboxItemType, OutboxStatus};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, warn};

use crate::api_client::{BatchApi, BatchResult};
use crate::metrics::{sub_in_flight, DispatcherMetrics};
use crate::repository::OutboxRepository;

/// Per-group worker tuning.
#[derive(Debug, Clone)]
pub struct GroupProcessorConfig {
    /// Maximum items per API call.
    pub api_batch_size: usize,
    /// How long to wait for more items before dispatching a partial batch.
    pub batch_linger: Duration,
}

impl Default for GroupProcessorConfig {
    fn default() -> Self {
        Self {
            api_batch_size: 100,
            batch_linger: Duration::from_millis(25),
        }
    }
}

/// Worker for one `(type, message group)` stream.
pub struct MessageGroupProcessor {
    item_type: OutboxItemType,
    group: String,
    config: GroupProcessorConfig,
    rx: mpsc::Receiver<OutboxItem>,
    repository: Arc<dyn OutboxRepository>,
    api: Arc<dyn BatchApi>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
    metrics: Arc<DispatcherMetrics>,
}

impl MessageGroupProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        item_type: OutboxItemType,
        group: String,
        config: GroupProcessorConfig,
        rx: mpsc::Receiver<OutboxItem>,
        repository: Arc<dyn OutboxRepository>,
        api: Arc<dyn BatchApi>,
        permits: Arc<Semaphore>,
        in_flight: Arc<AtomicU64>,
        metrics: Arc<DispatcherMetrics>,
    ) -> Self {
        Self {
            item_type,
            group,
            config,
            rx,
            repository,
            api,
            permits,
            in_flight,
            metrics,
        }
    }

    /// Worker loop. Exits when every sender is gone and the queue is drained,
    /// which is how shutdown reaches the workers.
    pub async fn run(mut self) {
        debug!(item_type = %self.item_type, group = %self.group, "Group worker started");

        while let Some(first) = self.rx.recv().await {
            let batch = self.collect_batch(first).await;
            self.dispatch_batch(batch).await;
        }

        debug!(item_type = %self.item_type, group = %self.group, "Group worker stopped");
    }

    /// Drain the queue up to the batch size, waiting at most the linger
    /// timeout for each further item. A single-item batch is valid.
    async fn collect_batch(&mut self, first: OutboxItem) -> Vec<OutboxItem> {
        let mut batch = vec![first];

        while batch.len() < self.config.api_batch_size {
            match tokio::time::timeout(self.config.batch_linger, self.rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                // Senders gone; dispatch what we have.
                Ok(None) => break,
                // Linger expired.
                Err(_) => break,
            }
        }

        batch
    }

    /// AWAITING_SLOT → DISPATCHING → IDLE. The permit spans the whole batch,
    /// not one item, and is released on every exit path by RAII.
    async fn dispatch_batch(&self, batch: Vec<OutboxItem>) {
        let permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                // Semaphore closed mid-shutdown. The rows stay IN_PROGRESS
                // and are rewound by recovery.
                warn!(
                    item_type = %self.item_type,
                    group = %self.group,
                    "Dispatch slot pool closed, leaving batch for recovery"
                );
                return;
            }
        };

        debug!(
            item_type = %self.item_type,
            group = %self.group,
            count = batch.len(),
            "Dispatching batch"
        );

        let result = self.api.submit_batch(self.item_type, &batch).await;
        self.apply_outcomes(&batch, result).await;

        drop(permit);
        sub_in_flight(&self.in_flight, batch.len() as u64);
    }

    /// Write the batch outcome back to the store, bulked by resulting
    /// status. A failed write is logged and the affected rows stay
    /// IN_PROGRESS until the recovery loop rewinds them.
    async fn apply_outcomes(&self, batch: &[OutboxItem], result: BatchResult) {
        if result.outcomes.len() != batch.len() {
            error!(
                item_type = %self.item_type,
                group = %self.group,
                expected = batch.len(),
                got = result.outcomes.len(),
                "Batch result size mismatch, leaving rows for recovery"
            );
            return;
        }

        let mut succeeded: Vec<String> = Vec::new();
        let mut failed: BTreeMap<i32, (OutboxStatus, Vec<String>, Option<String>)> = BTreeMap::new();

        for outcome in result.outcomes {
            if outcome.status == OutboxStatus::Success {
                succeeded.push(outcome.id);
            } else {
                let entry = failed
                    .entry(outcome.status.code())
                    .or_insert_with(|| (outcome.status, Vec::new(), outcome.error_message.clone()));
                entry.1.push(outcome.id);
            }
        }

        if !succeeded.is_empty() {
            let count = succeeded.len() as u64;
            match self
                .repository
                .mark_with_status(self.item_type, succeeded, OutboxStatus::Success)
                .await
            {
                Ok(()) => {
                    self.metrics
                        .items_succeeded
                        .fetch_add(count, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    error!(
                        item_type = %self.item_type,
                        group = %self.group,
                        error = %e,
                        "Failed to write success statuses, rows stay in progress"
                    );
                }
            }
        }

        for (_, (status, ids, error_message)) in failed {
            let count = ids.len() as u64;
            let message = error_message.unwrap_or_else(|| "unknown error".to_string());
            match self
                .repository
                .mark_with_status_and_error(self.item_type, ids, status, message)
                .await
            {
                Ok(()) => {
                    self.metrics
                        .items_failed
                        .fetch_add(count, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    error!(
                        item_type = %self.item_type,
                        group = %self.group,
                        error = %e,
                        "Failed to write error statuses, rows stay in progress"
                    );
                }
            }
        }
    }
}
