//! Outbox dispatcher assembly.
//!
//! Wires the poller, global buffer, group distributor and recovery task
//! around one repository and one batch API client, and owns the shared
//! state: the in-flight counter, the primary flag, the metrics counters and
//! the shutdown signal.
//!
//! The in-flight counter is advisory. It resets to zero on restart, which is
//! safe: outstanding work is IN_PROGRESS in the database and the orphan scan
//! rewinds it before the new leader polls.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rb_common::OutboxItem;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::api_client::BatchApi;
use crate::buffer::{GlobalBuffer, GlobalBufferConfig};
use crate::distributor::{GroupDistributor, GroupDistributorConfig};
use crate::group_processor::GroupProcessorConfig;
use crate::metrics::{DispatcherMetrics, MetricsSnapshot};
use crate::poller::{Poller, PollerConfig};
use crate::recovery::{RecoveryConfig, RecoveryTask};
use crate::repository::OutboxRepository;

#[cfg(feature = "standby")]
use tracing::error;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Master switch; a disabled dispatcher starts nothing.
    pub enabled: bool,
    pub poll_interval: Duration,
    pub recovery_interval: Duration,
    /// Rows fetched per poll, per item type.
    pub poll_batch_size: u32,
    /// Maximum items per API call.
    pub api_batch_size: usize,
    /// Partial-batch linger in the group workers.
    pub batch_linger: Duration,
    /// Pipeline backpressure ceiling.
    pub max_in_flight: u64,
    /// Global buffer capacity.
    pub global_buffer_size: usize,
    /// Concurrent API call cap across all groups.
    pub max_concurrent_groups: usize,
    /// Per-group queue capacity.
    pub group_queue_capacity: usize,
    /// Age after which recovery rewinds a non-success row.
    pub processing_timeout: Duration,
    /// Rows per recovery pass, per item type.
    pub recovery_scan_limit: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(1),
            recovery_interval: Duration::from_secs(60),
            poll_batch_size: 100,
            api_batch_size: 100,
            batch_linger: Duration::from_millis(25),
            max_in_flight: 1000,
            global_buffer_size: 2000,
            max_concurrent_groups: 50,
            group_queue_capacity: 1000,
            processing_timeout: Duration::from_secs(300),
            recovery_scan_limit: 1000,
        }
    }
}

/// The assembled outbox dispatcher.
pub struct OutboxDispatcher {
    config: DispatcherConfig,
    buffer_rx: Mutex<Option<mpsc::Receiver<OutboxItem>>>,
    distributor: Arc<GroupDistributor>,
    poller: Poller,
    recovery: Arc<RecoveryTask>,
    in_flight: Arc<AtomicU64>,
    is_primary: Arc<AtomicBool>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    metrics: Arc<DispatcherMetrics>,
}

impl OutboxDispatcher {
    pub fn new(
        config: DispatcherConfig,
        repository: Arc<dyn OutboxRepository>,
        api: Arc<dyn BatchApi>,
    ) -> Self {
        let in_flight = Arc::new(AtomicU64::new(0));
        // Primary by default: single-instance mode has no election.
        let is_primary = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(DispatcherMetrics::default());
        let (shutdown_tx, _) = broadcast::channel(1);

        let (buffer, buffer_rx) = GlobalBuffer::new(GlobalBufferConfig {
            capacity: config.global_buffer_size,
        });
        let buffer = Arc::new(buffer);

        let distributor = Arc::new(GroupDistributor::new(
            GroupDistributorConfig {
                queue_capacity: config.group_queue_capacity,
                max_concurrent_groups: config.max_concurrent_groups,
                processor: GroupProcessorConfig {
                    api_batch_size: config.api_batch_size,
                    batch_linger: config.batch_linger,
                },
            },
            Arc::clone(&repository),
            api,
            Arc::clone(&in_flight),
            Arc::clone(&metrics),
        ));

        let poller = Poller::new(
            PollerConfig {
                poll_interval: config.poll_interval,
                poll_batch_size: config.poll_batch_size,
                max_in_flight: config.max_in_flight,
            },
            Arc::clone(&repository),
            Arc::clone(&buffer),
            Arc::clone(&in_flight),
            Arc::clone(&is_primary),
            Arc::clone(&metrics),
        );

        let recovery = Arc::new(RecoveryTask::new(
            repository,
            RecoveryConfig {
                check_interval: config.recovery_interval,
                processing_timeout: config.processing_timeout,
                scan_limit: config.recovery_scan_limit,
            },
            Arc::clone(&is_primary),
            Arc::clone(&in_flight),
            Arc::clone(&metrics),
        ));

        Self {
            config,
            buffer_rx: Mutex::new(Some(buffer_rx)),
            distributor,
            poller,
            recovery,
            in_flight,
            is_primary,
            running: AtomicBool::new(false),
            shutdown_tx,
            metrics,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn set_primary(&self, primary: bool) {
        self.is_primary.store(primary, Ordering::SeqCst);
        if primary {
            info!("Outbox dispatcher became primary");
        } else {
            warn!("Outbox dispatcher lost primary role");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Counters plus pipeline gauges.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let in_flight = self.in_flight_count();
        let active_groups = self.distributor.active_groups().await;
        self.metrics.snapshot(in_flight, active_groups)
    }

    /// Run in single-instance mode: this replica is always primary. Rewinds
    /// orphaned IN_PROGRESS rows, then polls until [`shutdown`] is called.
    ///
    /// [`shutdown`]: OutboxDispatcher::shutdown
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            info!("Outbox dispatcher is disabled");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Outbox dispatcher already running");
            return Ok(());
        }

        self.log_startup();

        // Orphans must be back in PENDING before the first poll.
        self.recovery.recover_orphans().await?;

        self.run_pipeline().await;
        Ok(())
    }

    /// Run with leader election. The role watcher runs the orphan scan on
    /// every promotion before opening the poll gate.
    #[cfg(feature = "standby")]
    pub async fn start_with_standby(
        self: Arc<Self>,
        standby: Arc<rb_standby::StandbyService>,
    ) -> Result<()> {
        if !self.config.enabled {
            info!("Outbox dispatcher is disabled");
            return Ok(());
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Outbox dispatcher already running");
            return Ok(());
        }

        self.is_primary.store(false, Ordering::SeqCst);
        self.log_startup();

        let watcher_handle = {
            let dispatcher = Arc::clone(&self);
            let mut role_rx = standby.subscribe();
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    let role = *role_rx.borrow_and_update();

                    if role == rb_standby::Role::Primary && !dispatcher.is_primary() {
                        if let Err(e) = dispatcher.recovery.recover_orphans().await {
                            // The poll gate still opens: aged orphans are
                            // caught by the periodic pass.
                            error!(error = %e, "Orphan scan failed on promotion");
                        }
                        dispatcher.set_primary(true);
                    } else if role != rb_standby::Role::Primary && dispatcher.is_primary() {
                        dispatcher.set_primary(false);
                    }

                    tokio::select! {
                        changed = role_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
            })
        };

        self.run_pipeline().await;
        let _ = watcher_handle.await;
        Ok(())
    }

    /// Signal every loop to stop. Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping outbox dispatcher");
        let _ = self.shutdown_tx.send(());
    }

    fn log_startup(&self) {
        info!(
            poll_interval_ms = %self.config.poll_interval.as_millis(),
            poll_batch_size = %self.config.poll_batch_size,
            api_batch_size = %self.config.api_batch_size,
            max_in_flight = %self.config.max_in_flight,
            global_buffer_size = %self.config.global_buffer_size,
            max_concurrent_groups = %self.config.max_concurrent_groups,
            "Starting outbox dispatcher"
        );
    }

    /// Spawn the drainer and recovery loops, run the poll loop inline, then
    /// drain everything on shutdown.
    async fn run_pipeline(&self) {
        let drainer_handle = {
            let taken = self.buffer_rx.lock().expect("buffer_rx lock poisoned").take();
            let mut rx = match taken {
                Some(rx) => rx,
                None => {
                    warn!("Buffer drainer already consumed, dispatcher cannot restart");
                    return;
                }
            };
            let distributor = Arc::clone(&self.distributor);
            let mut shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        maybe_item = rx.recv() => match maybe_item {
                            Some(item) => distributor.distribute(item).await,
                            None => break,
                        },
                        _ = shutdown.recv() => {
                            // Stop accepting, hand over what is buffered.
                            rx.close();
                            while let Some(item) = rx.recv().await {
                                distributor.distribute(item).await;
                            }
                            break;
                        }
                    }
                }
                debug!("Buffer drainer stopped");
            })
        };

        let recovery_handle = {
            let recovery = Arc::clone(&self.recovery);
            let shutdown = self.shutdown_tx.subscribe();
            tokio::spawn(async move { recovery.run(shutdown).await })
        };

        self.poller.run(self.shutdown_tx.subscribe()).await;

        let _ = recovery_handle.await;
        let _ = drainer_handle.await;
        self.distributor.shutdown().await;

        info!("Outbox dispatcher stopped");
    }
}
