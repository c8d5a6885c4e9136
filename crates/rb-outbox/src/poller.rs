//! Outbox poller.
//!
//! One loop on a fixed interval. A tick is skipped when the instance is not
//! primary, when the previous tick is still running, or when the in-flight
//! count leaves no room for a full batch. Fetched rows are bulk-marked
//! IN_PROGRESS and offered to the global buffer without blocking; refused
//! rows stay IN_PROGRESS and are rewound by recovery.
//!
//! The fetch itself takes no row locks. Only the single leader polls, and
//! within one poll the `ORDER BY message_group, created_at, id` clause keeps
//! a group's rows in commit order; across polls, a group's next PENDING row
//! is always younger than everything already fetched for that group.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rb_common::{OutboxItemType, ITEM_TYPES};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::buffer::GlobalBuffer;
use crate::metrics::DispatcherMetrics;
use crate::repository::OutboxRepository;

/// Poller configuration.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    /// Rows fetched per tick, per item type.
    pub poll_batch_size: u32,
    /// Ceiling on items accepted into the pipeline but not yet terminally
    /// written.
    pub max_in_flight: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 100,
            max_in_flight: 1000,
        }
    }
}

/// Periodic outbox poller.
pub struct Poller {
    config: PollerConfig,
    repository: Arc<dyn OutboxRepository>,
    buffer: Arc<GlobalBuffer>,
    in_flight: Arc<AtomicU64>,
    is_primary: Arc<AtomicBool>,
    busy: AtomicBool,
    metrics: Arc<DispatcherMetrics>,
}

impl Poller {
    pub fn new(
        config: PollerConfig,
        repository: Arc<dyn OutboxRepository>,
        buffer: Arc<GlobalBuffer>,
        in_flight: Arc<AtomicU64>,
        is_primary: Arc<AtomicBool>,
        metrics: Arc<DispatcherMetrics>,
    ) -> Self {
        Self {
            config,
            repository,
            buffer,
            in_flight,
            is_primary,
            busy: AtomicBool::new(false),
            metrics,
        }
    }

    /// Poll loop. Runs until the shutdown signal fires. Tick errors are
    /// logged and the loop continues.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => break,
            }

            if !self.is_primary.load(Ordering::SeqCst) {
                debug!("Skipping poll: not primary");
                continue;
            }

            // Latch against overlapping ticks.
            if self.busy.swap(true, Ordering::SeqCst) {
                debug!("Skipping poll: previous tick still running");
                continue;
            }

            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Poll tick failed");
            }

            self.busy.store(false, Ordering::SeqCst);
        }

        debug!("Poller stopped");
    }

    /// One tick: both item types, each with its own capacity check.
    pub async fn poll_once(&self) -> Result<()> {
        for item_type in ITEM_TYPES {
            self.poll_type(item_type).await?;
        }
        Ok(())
    }

    async fn poll_type(&self, item_type: OutboxItemType) -> Result<()> {
        let in_flight = self.in_flight.load(Ordering::SeqCst);
        let available = self.config.max_in_flight.saturating_sub(in_flight);
        if available < self.config.poll_batch_size as u64 {
            debug!(
                item_type = %item_type,
                in_flight,
                max_in_flight = self.config.max_in_flight,
                "Skipping poll: insufficient capacity"
            );
            return Ok(());
        }

        let items = self
            .repository
            .fetch_pending(item_type, self.config.poll_batch_size)
            .await?;
        if items.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        self.repository.mark_in_progress(item_type, ids).await?;

        let count = items.len() as u64;
        self.in_flight.fetch_add(count, Ordering::SeqCst);
        self.metrics.items_polled.fetch_add(count, Ordering::Relaxed);

        debug!(item_type = %item_type, count, "Polled pending items");

        let rejected = self.buffer.add_all(items);
        if rejected > 0 {
            self.metrics
                .buffer_rejected
                .fetch_add(rejected as u64, Ordering::Relaxed);
            warn!(
                item_type = %item_type,
                rejected,
                "Global buffer full, refused rows stay IN_PROGRESS until recovery"
            );
        }

        Ok(())
    }
}
