//! SQLite outbox repository.
//!
//! Timestamps are stored as integer milliseconds since the epoch. Table
//! names come from [`OutboxTableConfig`] so the dispatcher can point at
//! whatever tables the producing application owns.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rb_common::{OutboxItem, OutboxItemType, OutboxStatus};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::repository::{OutboxRepository, OutboxTableConfig};

const SELECT_COLUMNS: &str =
    "id, message_group, payload, status, retry_count, error_message, created_at, updated_at";

/// SQLite implementation of [`OutboxRepository`].
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
    table_config: OutboxTableConfig,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table_config: OutboxTableConfig::default(),
        }
    }

    pub fn with_config(pool: SqlitePool, table_config: OutboxTableConfig) -> Self {
        Self { pool, table_config }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a row the way a producer would. Test and tooling helper; the
    /// dispatcher core itself never inserts.
    pub async fn insert(&self, item: &OutboxItem) -> Result<()> {
        let table = self.table_config.table_for_type(item.item_type);
        let query = format!(
            "INSERT INTO {} (id, type, message_group, payload, status, retry_count, error_message, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            table
        );

        sqlx::query(&query)
            .bind(&item.id)
            .bind(item.item_type.to_string())
            .bind(&item.message_group)
            .bind(&item.payload)
            .bind(item.status.code())
            .bind(item.retry_count)
            .bind(&item.error_message)
            .bind(item.created_at.timestamp_millis())
            .bind(item.updated_at.map(|t| t.timestamp_millis()))
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Placeholder list for an `IN (…)` clause.
    fn build_in_clause(count: usize) -> String {
        let placeholders: Vec<&str> = (0..count).map(|_| "?").collect();
        placeholders.join(", ")
    }

    fn parse_row(row: &sqlx::sqlite::SqliteRow, item_type: OutboxItemType) -> Result<OutboxItem> {
        let created_at_ts: i64 = row.get("created_at");
        let created_at = DateTime::from_timestamp_millis(created_at_ts)
            .ok_or_else(|| anyhow::anyhow!("Invalid created_at timestamp"))?;

        let updated_at_ts: Option<i64> = row.try_get("updated_at").ok();
        let updated_at = updated_at_ts.and_then(DateTime::from_timestamp_millis);

        let status_code: i32 = row.get("status");

        Ok(OutboxItem {
            id: row.get("id"),
            item_type,
            message_group: row.try_get("message_group").ok(),
            payload: row.get("payload"),
            status: OutboxStatus::from_code(status_code),
            retry_count: row.get::<i32, _>("retry_count"),
            error_message: row.try_get("error_message").ok().flatten(),
            created_at,
            updated_at,
        })
    }

    async fn fetch_items(&self, query: String, item_type: OutboxItemType) -> Result<Vec<OutboxItem>> {
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(Self::parse_row(row, item_type)?);
        }
        Ok(items)
    }

    async fn set_status(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
        status: OutboxStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for_type(item_type);
        let now = Utc::now().timestamp_millis();
        let in_clause = Self::build_in_clause(ids.len());

        let query = format!(
            "UPDATE {} SET status = ?, error_message = ?, updated_at = ? WHERE id IN ({})",
            table, in_clause
        );

        let mut q = sqlx::query(&query)
            .bind(status.code())
            .bind(&error_message)
            .bind(now);
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;

        debug!(table = %table, status = ?status, count = ids.len(), "Marked items with status");
        Ok(())
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn fetch_pending(&self, item_type: OutboxItemType, limit: u32) -> Result<Vec<OutboxItem>> {
        let table = self.table_config.table_for_type(item_type);
        // The id tiebreaker keeps same-millisecond rows in insertion order:
        // ids are lexicographically time-ordered.
        let query = format!(
            "SELECT {} FROM {} WHERE status = {} ORDER BY message_group, created_at, id LIMIT {}",
            SELECT_COLUMNS,
            table,
            OutboxStatus::Pending.code(),
            limit
        );

        let items = self.fetch_items(query, item_type).await?;
        debug!(table = %table, count = items.len(), "Fetched pending items");
        Ok(items)
    }

    async fn mark_in_progress(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for_type(item_type);
        let now = Utc::now().timestamp_millis();
        let in_clause = Self::build_in_clause(ids.len());

        // Gated on PENDING: redundant under the single-leader invariant but
        // cheap, and it keeps a misconfigured second poller from stealing
        // rows mid-flight.
        let query = format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE id IN ({}) AND status = ?",
            table, in_clause
        );

        let mut q = sqlx::query(&query)
            .bind(OutboxStatus::InProgress.code())
            .bind(now);
        for id in &ids {
            q = q.bind(id);
        }
        q = q.bind(OutboxStatus::Pending.code());
        q.execute(&self.pool).await?;

        debug!(table = %table, count = ids.len(), "Marked items as in progress");
        Ok(())
    }

    async fn mark_with_status(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
        status: OutboxStatus,
    ) -> Result<()> {
        self.set_status(item_type, ids, status, None).await
    }

    async fn mark_with_status_and_error(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
        status: OutboxStatus,
        error_message: String,
    ) -> Result<()> {
        self.set_status(item_type, ids, status, Some(error_message))
            .await
    }

    async fn fetch_stuck_items(&self, item_type: OutboxItemType) -> Result<Vec<OutboxItem>> {
        let table = self.table_config.table_for_type(item_type);
        let query = format!(
            "SELECT {} FROM {} WHERE status = {} ORDER BY created_at",
            SELECT_COLUMNS,
            table,
            OutboxStatus::InProgress.code()
        );
        self.fetch_items(query, item_type).await
    }

    async fn reset_stuck_items(&self, item_type: OutboxItemType, ids: Vec<String>) -> Result<()> {
        self.reset_recoverable_items(item_type, ids).await
    }

    async fn fetch_recoverable_items(
        &self,
        item_type: OutboxItemType,
        timeout: Duration,
        limit: u32,
    ) -> Result<Vec<OutboxItem>> {
        let table = self.table_config.table_for_type(item_type);
        let cutoff = Utc::now().timestamp_millis() - timeout.as_millis() as i64;
        let codes = OutboxStatus::recoverable_codes()
            .map(|c| c.to_string())
            .join(", ");

        let query = format!(
            "SELECT {} FROM {} WHERE status IN ({}) AND updated_at < {} ORDER BY created_at LIMIT {}",
            SELECT_COLUMNS, table, codes, cutoff, limit
        );
        self.fetch_items(query, item_type).await
    }

    async fn reset_recoverable_items(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for_type(item_type);
        let now = Utc::now().timestamp_millis();
        let in_clause = Self::build_in_clause(ids.len());

        let query = format!(
            "UPDATE {} SET status = ?, updated_at = ? WHERE id IN ({})",
            table, in_clause
        );

        let mut q = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(now);
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;

        info!(table = %table, count = ids.len(), "Reset items to pending");
        Ok(())
    }

    async fn increment_retry_count(
        &self,
        item_type: OutboxItemType,
        ids: Vec<String>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let table = self.table_config.table_for_type(item_type);
        let now = Utc::now().timestamp_millis();
        let in_clause = Self::build_in_clause(ids.len());

        let query = format!(
            "UPDATE {} SET retry_count = retry_count + 1, status = ?, updated_at = ? WHERE id IN ({})",
            table, in_clause
        );

        let mut q = sqlx::query(&query)
            .bind(OutboxStatus::Pending.code())
            .bind(now);
        for id in &ids {
            q = q.bind(id);
        }
        q.execute(&self.pool).await?;

        debug!(table = %table, count = ids.len(), "Incremented retry count and reset to pending");
        Ok(())
    }

    async fn count_pending(&self, item_type: OutboxItemType) -> Result<u64> {
        let table = self.table_config.table_for_type(item_type);
        let query = format!(
            "SELECT COUNT(*) AS cnt FROM {} WHERE status = {}",
            table,
            OutboxStatus::Pending.code()
        );
        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get("cnt");
        Ok(count as u64)
    }

    async fn create_schema(&self) -> Result<()> {
        for table in [
            self.table_config.events_table.clone(),
            self.table_config.dispatch_jobs_table.clone(),
        ] {
            let create = format!(
                r#"CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    type TEXT NOT NULL,
                    message_group TEXT,
                    payload TEXT NOT NULL,
                    status INTEGER NOT NULL DEFAULT 0,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER
                )"#,
                table
            );
            sqlx::query(&create).execute(&self.pool).await?;

            let index_name = table.replace('.', "_");
            // Poll query: status, group, commit order.
            let poll_index = format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_poll ON {}(status, message_group, created_at)",
                index_name, table
            );
            sqlx::query(&poll_index).execute(&self.pool).await?;

            // Recovery scan: status, age.
            let recovery_index = format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_recovery ON {}(status, created_at)",
                index_name, table
            );
            sqlx::query(&recovery_index).execute(&self.pool).await?;
        }

        info!(
            events_table = %self.table_config.events_table,
            dispatch_jobs_table = %self.table_config.dispatch_jobs_table,
            "Initialized SQLite outbox schema"
        );

        Ok(())
    }

    fn table_name(&self, item_type: OutboxItemType) -> &str {
        self.table_config.table_for_type(item_type)
    }
}
