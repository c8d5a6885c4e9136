//! Group distributor.
//!
//! Routes each item to the worker owning its `(type, message group)` key,
//! creating workers lazily. Workers are long-lived: a group that goes quiet
//! keeps its worker, so a re-appearing group lands on the same FIFO stream.
//! Enqueueing into a full per-group queue blocks, which stalls the buffer
//! drainer and, through the full buffer, the poller: backpressure flows up
//! the whole chain.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use rb_common::{OutboxItem, OutboxItemType};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api_client::BatchApi;
use crate::group_processor::{GroupProcessorConfig, MessageGroupProcessor};
use crate::metrics::DispatcherMetrics;
use crate::repository::OutboxRepository;

/// Distributor configuration.
#[derive(Debug, Clone)]
pub struct GroupDistributorConfig {
    /// Per-group queue capacity.
    pub queue_capacity: usize,
    /// Permits shared by all workers; caps concurrent API calls.
    pub max_concurrent_groups: usize,
    /// Worker tuning.
    pub processor: GroupProcessorConfig,
}

impl Default for GroupDistributorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            max_concurrent_groups: 50,
            processor: GroupProcessorConfig::default(),
        }
    }
}

type GroupKey = (OutboxItemType, String);

struct GroupHandle {
    tx: mpsc::Sender<OutboxItem>,
    worker: JoinHandle<()>,
}

/// Routes items to per-group workers.
pub struct GroupDistributor {
    config: GroupDistributorConfig,
    repository: Arc<dyn OutboxRepository>,
    api: Arc<dyn BatchApi>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicU64>,
    metrics: Arc<DispatcherMetrics>,
    groups: RwLock<HashMap<GroupKey, GroupHandle>>,
}

impl GroupDistributor {
    pub fn new(
        config: GroupDistributorConfig,
        repository: Arc<dyn OutboxRepository>,
        api: Arc<dyn BatchApi>,
        in_flight: Arc<AtomicU64>,
        metrics: Arc<DispatcherMetrics>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_groups));
        Self {
            config,
            repository,
            api,
            permits,
            in_flight,
            metrics,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Hand one item to its group worker. Blocks while the group's queue is
    /// full. An item refused because the worker is gone (shutdown) stays
    /// IN_PROGRESS and is rewound by recovery.
    pub async fn distribute(&self, item: OutboxItem) {
        let key: GroupKey = (item.item_type, item.group_key().to_string());
        let tx = self.sender_for(&key).await;

        if let Err(e) = tx.send(item).await {
            warn!(
                item_id = %e.0.id,
                item_type = %key.0,
                group = %key.1,
                "Group worker gone, leaving item for recovery"
            );
        }
    }

    /// Get or create the worker for a key. Creation is atomic per key: the
    /// write lock plus double-check is the compare-and-set insertion.
    async fn sender_for(&self, key: &GroupKey) -> mpsc::Sender<OutboxItem> {
        {
            let groups = self.groups.read().await;
            if let Some(handle) = groups.get(key) {
                return handle.tx.clone();
            }
        }

        let mut groups = self.groups.write().await;
        if let Some(handle) = groups.get(key) {
            return handle.tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let processor = MessageGroupProcessor::new(
            key.0,
            key.1.clone(),
            self.config.processor.clone(),
            rx,
            Arc::clone(&self.repository),
            Arc::clone(&self.api),
            Arc::clone(&self.permits),
            Arc::clone(&self.in_flight),
            Arc::clone(&self.metrics),
        );
        let worker = tokio::spawn(processor.run());

        info!(item_type = %key.0, group = %key.1, "Created message group worker");
        groups.insert(key.clone(), GroupHandle { tx: tx.clone(), worker });

        tx
    }

    /// Number of live group workers.
    pub async fn active_groups(&self) -> usize {
        self.groups.read().await.len()
    }

    /// Permits not currently held by a dispatching worker.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Drop every group sender and wait for the workers to drain their
    /// queues and finish their in-flight batches.
    pub async fn shutdown(&self) {
        let handles: Vec<(GroupKey, JoinHandle<()>)> = {
            let mut groups = self.groups.write().await;
            groups
                .drain()
                .map(|(key, handle)| {
                    drop(handle.tx);
                    (key, handle.worker)
                })
                .collect()
        };

        for (key, worker) in handles {
            if worker.await.is_err() {
                warn!(item_type = %key.0, group = %key.1, "Group worker panicked during shutdown");
            } else {
                debug!(item_type = %key.0, group = %key.1, "Group worker drained");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::BatchResult;
    use anyhow::Result;
    use async_trait::async_trait;
    use rb_common::OutboxStatus;
    use std::sync::Mutex;
    use std::time::Duration;

    struct CountingApi {
        batches: Mutex<Vec<(OutboxItemType, Vec<String>)>>,
    }

    #[async_trait]
    impl BatchApi for CountingApi {
        async fn submit_batch(
            &self,
            item_type: OutboxItemType,
            items: &[OutboxItem],
        ) -> BatchResult {
            self.batches
                .lock()
                .unwrap()
                .push((item_type, items.iter().map(|i| i.id.clone()).collect()));
            BatchResult::uniform(items, OutboxStatus::Success, None)
        }
    }

    #[derive(Default)]
    struct NullRepo;

    #[async_trait]
    impl OutboxRepository for NullRepo {
        async fn fetch_pending(&self, _t: OutboxItemType, _l: u32) -> Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn mark_in_progress(&self, _t: OutboxItemType, _ids: Vec<String>) -> Result<()> {
            Ok(())
        }
        async fn mark_with_status(
            &self,
            _t: OutboxItemType,
            _ids: Vec<String>,
            _s: OutboxStatus,
        ) -> Result<()> {
            Ok(())
        }
        async fn mark_with_status_and_error(
            &self,
            _t: OutboxItemType,
            _ids: Vec<String>,
            _s: OutboxStatus,
            _e: String,
        ) -> Result<()> {
            Ok(())
        }
        async fn fetch_stuck_items(&self, _t: OutboxItemType) -> Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn reset_stuck_items(&self, _t: OutboxItemType, _ids: Vec<String>) -> Result<()> {
            Ok(())
        }
        async fn fetch_recoverable_items(
            &self,
            _t: OutboxItemType,
            _timeout: Duration,
            _l: u32,
        ) -> Result<Vec<OutboxItem>> {
            Ok(Vec::new())
        }
        async fn reset_recoverable_items(
            &self,
            _t: OutboxItemType,
            _ids: Vec<String>,
        ) -> Result<()> {
            Ok(())
        }
        async fn increment_retry_count(
            &self,
            _t: OutboxItemType,
            _ids: Vec<String>,
        ) -> Result<()> {
            Ok(())
        }
        async fn count_pending(&self, _t: OutboxItemType) -> Result<u64> {
            Ok(0)
        }
        async fn create_schema(&self) -> Result<()> {
            Ok(())
        }
        fn table_name(&self, _t: OutboxItemType) -> &str {
            "outbox_events"
        }
    }

    fn item(id: &str, item_type: OutboxItemType, group: Option<&str>) -> OutboxItem {
        OutboxItem {
            id: id.to_string(),
            item_type,
            message_group: group.map(String::from),
            payload: "{}".to_string(),
            status: OutboxStatus::InProgress,
            retry_count: 0,
            created_at: chrono::Utc::now(),
            updated_at: None,
            error_message: None,
        }
    }

    fn distributor(api: Arc<CountingApi>) -> GroupDistributor {
        GroupDistributor::new(
            GroupDistributorConfig::default(),
            Arc::new(NullRepo),
            api,
            Arc::new(AtomicU64::new(100)),
            Arc::new(DispatcherMetrics::default()),
        )
    }

    #[tokio::test]
    async fn creates_one_worker_per_key() {
        let api = Arc::new(CountingApi {
            batches: Mutex::new(Vec::new()),
        });
        let distributor = distributor(Arc::clone(&api));

        distributor
            .distribute(item("e-1", OutboxItemType::Event, Some("a")))
            .await;
        distributor
            .distribute(item("e-2", OutboxItemType::Event, Some("a")))
            .await;
        distributor
            .distribute(item("e-3", OutboxItemType::Event, Some("b")))
            .await;
        // Same group name, different type: distinct FIFO stream.
        distributor
            .distribute(item("d-1", OutboxItemType::DispatchJob, Some("a")))
            .await;

        assert_eq!(distributor.active_groups().await, 3);
        distributor.shutdown().await;

        let batches = api.batches.lock().unwrap();
        let dispatched: usize = batches.iter().map(|(_, ids)| ids.len()).sum();
        assert_eq!(dispatched, 4);
    }

    #[tokio::test]
    async fn absent_group_normalizes_to_default() {
        let api = Arc::new(CountingApi {
            batches: Mutex::new(Vec::new()),
        });
        let distributor = distributor(api);

        distributor
            .distribute(item("e-1", OutboxItemType::Event, None))
            .await;
        distributor
            .distribute(item("e-2", OutboxItemType::Event, Some("")))
            .await;

        // Both land on the same "default" worker.
        assert_eq!(distributor.active_groups().await, 1);
        distributor.shutdown().await;
    }

    #[tokio::test]
    async fn workers_survive_idle_periods() {
        let api = Arc::new(CountingApi {
            batches: Mutex::new(Vec::new()),
        });
        let distributor = distributor(Arc::clone(&api));

        distributor
            .distribute(item("e-1", OutboxItemType::Event, Some("a")))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The group went quiet but its worker is still there.
        assert_eq!(distributor.active_groups().await, 1);

        distributor
            .distribute(item("e-2", OutboxItemType::Event, Some("a")))
            .await;
        distributor.shutdown().await;

        let batches = api.batches.lock().unwrap();
        let ids: Vec<String> = batches.iter().flat_map(|(_, ids)| ids.clone()).collect();
        assert_eq!(ids, vec!["e-1", "e-2"]);
    }
}
