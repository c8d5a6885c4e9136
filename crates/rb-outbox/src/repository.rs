//! Outbox repository contract.
//!
//! Status-typed row reads and writes over the two outbox tables. All queries
//! are plain SELECT/UPDATE without row locks: correctness rests on the
//! single-leader invariant upheld by the standby service. Implementations
//! that cannot guarantee a single poller must add row-level locking to
//! `fetch_pending`/`mark_in_progress`.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rb_common::{OutboxItem, OutboxItemType, OutboxStatus};

/// Table names backing the two item types.
#[derive(Debug, Clone)]
pub struct OutboxTableConfig {
    pub events_table: String,
    pub dispatch_jobs_table: String,
}

impl Default for OutboxTableConfig {
    fn default() -> Self {
        Self {
            events_table: "outbox_events".to_string(),
            dispatch_jobs_table: "outbox_dispatch_jobs".to_string(),
        }
    }
}

impl OutboxTableConfig {
    pub fn table_for_type(&self, item_type: OutboxItemType) -> &str {
        match item_type {
            OutboxItemType::Event => &self.events_table,
            OutboxItemType::DispatchJob => &self.dispatch_jobs_table,
        }
    }
}

/// Persistence contract for the dispatcher pipeline.
///
/// Every status write refreshes `updated_at`; `created_at` is never touched.
/// Bulk operations take the full id set of one batch and complete
/// atomically per id set.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Fetch up to `limit` PENDING rows of the given type, ordered by
    /// `message_group, created_at, id` so one group's rows arrive in commit
    /// order.
    async fn fetch_pending(&self, item_type: OutboxItemType, limit: u32) -> Result<Vec<OutboxItem>>;

    /// Transition rows to IN_PROGRESS. Gated on `status = PENDING`.
    async fn mark_in_progress(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()>;

    /// Write a terminal status for the given rows.
    async fn mark_with_status(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
        status: OutboxStatus,
    ) -> Result<()>;

    /// Write a terminal status together with the last error detail.
    async fn mark_with_status_and_error(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
        status: OutboxStatus,
        error_message: String,
    ) -> Result<()>;

    /// Every IN_PROGRESS row, regardless of age. Used by the startup orphan
    /// scan: a freshly promoted leader owns nothing, so all of these are
    /// orphans.
    async fn fetch_stuck_items(&self, item_type: OutboxItemType) -> Result<Vec<OutboxItem>>;

    /// Rewind orphaned IN_PROGRESS rows to PENDING.
    async fn reset_stuck_items(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()>;

    /// Rows in a recoverable status (IN_PROGRESS or any error) whose
    /// `updated_at` is older than `timeout`.
    async fn fetch_recoverable_items(
        &self,
        item_type: OutboxItemType,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<OutboxItem>>;

    /// Rewind recoverable rows to PENDING without touching `retry_count`.
    /// Idempotent.
    async fn reset_recoverable_items(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
    ) -> Result<()>;

    /// Bump `retry_count` and reset to PENDING in one write.
    async fn increment_retry_count(&self, item_type: OutboxItemType, ids: Vec<String>)
        -> Result<()>;

    /// Number of PENDING rows of the given type.
    async fn count_pending(&self, item_type: OutboxItemType) -> Result<u64>;

    /// Create tables and indexes if they do not exist.
    async fn create_schema(&self) -> Result<()>;

    /// Table backing the given item type.
    fn table_name(&self, item_type: OutboxItemType) -> &str;
}
