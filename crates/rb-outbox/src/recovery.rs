//! Crash and retry recovery.
//!
//! Two passes over the outbox tables, both gated on leadership:
//!
//! - **Orphan pass**, run on every promotion before polling starts: a fresh
//!   leader owns nothing, so every IN_PROGRESS row is an orphan from a dead
//!   or demoted leader and is reset to PENDING with no age check.
//! - **Periodic pass**: rows in a recoverable status (IN_PROGRESS or any
//!   error) whose last write is older than the processing timeout are
//!   rewound to PENDING, bumping `retry_count` for operator triage. No
//!   retry cap is enforced.
//!
//! Both rewinds are idempotent, so the pass never races a live processor: a
//! worker that still holds an id rewrites its status well inside the
//! timeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rb_common::{OutboxStatus, ITEM_TYPES};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::metrics::{sub_in_flight, DispatcherMetrics};
use crate::repository::OutboxRepository;

/// Recovery configuration.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Periodic pass interval.
    pub check_interval: Duration,
    /// Age after which a recoverable row is rewound.
    pub processing_timeout: Duration,
    /// Rows per pass, per item type.
    pub scan_limit: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            processing_timeout: Duration::from_secs(300),
            scan_limit: 1000,
        }
    }
}

/// Background recovery task.
pub struct RecoveryTask {
    repository: Arc<dyn OutboxRepository>,
    config: RecoveryConfig,
    is_primary: Arc<AtomicBool>,
    in_flight: Arc<AtomicU64>,
    metrics: Arc<DispatcherMetrics>,
}

impl RecoveryTask {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        config: RecoveryConfig,
        is_primary: Arc<AtomicBool>,
        in_flight: Arc<AtomicU64>,
        metrics: Arc<DispatcherMetrics>,
    ) -> Self {
        Self {
            repository,
            config,
            is_primary,
            in_flight,
            metrics,
        }
    }

    /// Startup/promotion pass: rewind every IN_PROGRESS row.
    pub async fn recover_orphans(&self) -> Result<u64> {
        let mut total = 0u64;

        for item_type in ITEM_TYPES {
            let stuck = self.repository.fetch_stuck_items(item_type).await?;
            if stuck.is_empty() {
                continue;
            }

            let ids: Vec<String> = stuck.iter().map(|i| i.id.clone()).collect();
            let count = ids.len() as u64;
            self.repository.reset_stuck_items(item_type, ids).await?;
            total += count;
        }

        if total > 0 {
            info!(count = total, "Reset orphaned in-progress rows to pending");
        }
        Ok(total)
    }

    /// Periodic pass: rewind aged-out recoverable rows, counting the retry.
    pub async fn recover_once(&self) -> Result<u64> {
        let mut total = 0u64;

        for item_type in ITEM_TYPES {
            let items = self
                .repository
                .fetch_recoverable_items(item_type, self.config.processing_timeout, self.config.scan_limit)
                .await?;
            if items.is_empty() {
                continue;
            }

            // Only rows still IN_PROGRESS are still counted in-flight; the
            // terminally-errored ones were decremented by their processor.
            let still_counted = items
                .iter()
                .filter(|i| i.status == OutboxStatus::InProgress)
                .count() as u64;

            let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
            let count = ids.len() as u64;
            self.repository.increment_retry_count(item_type, ids).await?;

            sub_in_flight(&self.in_flight, still_counted);
            total += count;
        }

        if total > 0 {
            self.metrics
                .items_recovered
                .fetch_add(total, Ordering::Relaxed);
            info!(count = total, "Rewound recoverable rows to pending");
        }
        Ok(total)
    }

    /// Recovery loop. Runs until the shutdown signal fires; tick errors are
    /// logged and the loop continues.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => break,
            }

            if !self.is_primary.load(Ordering::SeqCst) {
                debug!("Skipping recovery: not primary");
                continue;
            }

            if let Err(e) = self.recover_once().await {
                error!(error = %e, "Recovery tick failed");
            }
        }

        debug!("Recovery task stopped");
    }
}
