//! Relaybox outbox dispatcher core.
//!
//! Drains application-owned outbox tables and delivers each row at least
//! once to the downstream batch API, preserving FIFO order within a
//! `(type, message group)` stream. One replica polls at a time (leader
//! election lives in `rb-standby`); everything the leader holds in memory is
//! reconstructible from row status after a crash.
//!
//! Data flow: poller → global buffer → group distributor → per-group FIFO
//! worker → batch API client → repository. A timed recovery loop rewinds
//! rows that got stuck along the way.

pub mod api_client;
pub mod buffer;
pub mod dispatcher;
pub mod distributor;
pub mod group_processor;
pub mod metrics;
pub mod poller;
pub mod recovery;
pub mod repository;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use api_client::{BatchApi, BatchApiConfig, BatchResult, HttpBatchApiClient, ItemOutcome};
pub use buffer::{BufferFullError, GlobalBuffer, GlobalBufferConfig};
pub use dispatcher::{DispatcherConfig, OutboxDispatcher};
pub use distributor::{GroupDistributor, GroupDistributorConfig};
pub use group_processor::{GroupProcessorConfig, MessageGroupProcessor};
pub use metrics::{DispatcherMetrics, MetricsSnapshot};
pub use poller::{Poller, PollerConfig};
pub use recovery::{RecoveryConfig, RecoveryTask};
pub use repository::{OutboxRepository, OutboxTableConfig};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxRepository;
