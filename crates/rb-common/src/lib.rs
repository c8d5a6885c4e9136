//! Shared domain types for the relaybox outbox dispatcher.
//!
//! The status codes defined here are stored as integers in the outbox tables
//! and are part of the stable wire contract; do not renumber them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod logging;

/// Message group assigned to rows whose `message_group` column is NULL or
/// empty. All such rows of one type form a single FIFO stream.
pub const DEFAULT_MESSAGE_GROUP: &str = "default";

/// Outbox row status. Stored as an integer code in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting to be picked up by the poller (code: 0)
    Pending,
    /// Delivered and acknowledged (code: 1)
    Success,
    /// Rejected by the API, 4xx semantics (code: 2)
    BadRequest,
    /// Remote server error, 5xx semantics (code: 3)
    InternalError,
    /// Authentication failed (code: 4)
    Unauthorized,
    /// Permission denied (code: 5)
    Forbidden,
    /// Upstream gateway or transport failure (code: 6)
    GatewayError,
    /// Owned by the running dispatcher (code: 9)
    InProgress,
}

impl OutboxStatus {
    /// Integer wire code for database storage.
    pub fn code(&self) -> i32 {
        match self {
            OutboxStatus::Pending => 0,
            OutboxStatus::Success => 1,
            OutboxStatus::BadRequest => 2,
            OutboxStatus::InternalError => 3,
            OutboxStatus::Unauthorized => 4,
            OutboxStatus::Forbidden => 5,
            OutboxStatus::GatewayError => 6,
            OutboxStatus::InProgress => 9,
        }
    }

    /// Decode a stored code. Unknown codes fall back to `Pending` so a
    /// damaged row re-enters the pipeline instead of vanishing.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => OutboxStatus::Pending,
            1 => OutboxStatus::Success,
            2 => OutboxStatus::BadRequest,
            3 => OutboxStatus::InternalError,
            4 => OutboxStatus::Unauthorized,
            5 => OutboxStatus::Forbidden,
            6 => OutboxStatus::GatewayError,
            9 => OutboxStatus::InProgress,
            _ => OutboxStatus::Pending,
        }
    }

    /// Statuses the recovery loop may rewind back to `Pending`.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, OutboxStatus::Pending | OutboxStatus::Success)
    }

    /// `Success` is the only hard-terminal status; every error status is
    /// soft-terminal and subject to recovery.
    pub fn is_final(&self) -> bool {
        matches!(self, OutboxStatus::Success)
    }

    /// All codes the recovery scan queries for.
    pub fn recoverable_codes() -> [i32; 6] {
        [
            OutboxStatus::InProgress.code(),
            OutboxStatus::BadRequest.code(),
            OutboxStatus::InternalError.code(),
            OutboxStatus::Unauthorized.code(),
            OutboxStatus::Forbidden.code(),
            OutboxStatus::GatewayError.code(),
        ]
    }
}

impl Default for OutboxStatus {
    fn default() -> Self {
        OutboxStatus::Pending
    }
}

/// Outbox item type. Selects the backing table and the target endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxItemType {
    /// Sent to /api/events/batch
    Event,
    /// Sent to /api/dispatch/jobs/batch
    DispatchJob,
}

/// Both item types, in poll order.
pub const ITEM_TYPES: [OutboxItemType; 2] = [OutboxItemType::Event, OutboxItemType::DispatchJob];

impl OutboxItemType {
    /// API endpoint path for this item type.
    pub fn api_path(&self) -> &'static str {
        match self {
            OutboxItemType::Event => "/api/events/batch",
            OutboxItemType::DispatchJob => "/api/dispatch/jobs/batch",
        }
    }
}

impl std::str::FromStr for OutboxItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "EVENT" => Ok(OutboxItemType::Event),
            "DISPATCH_JOB" | "DISPATCHJOB" | "DISPATCH-JOB" => Ok(OutboxItemType::DispatchJob),
            other => Err(format!("unknown outbox item type: {}", other)),
        }
    }
}

impl std::fmt::Display for OutboxItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutboxItemType::Event => write!(f, "EVENT"),
            OutboxItemType::DispatchJob => write!(f, "DISPATCH_JOB"),
        }
    }
}

/// One outbox row, as read from a customer's outbox table.
///
/// `payload` is carried as opaque JSON text; the batch API client parses it
/// immediately before dispatch so a malformed payload fails the batch rather
/// than the poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxItem {
    /// Globally unique, lexicographically time-ordered id assigned by the
    /// producer's storage layer.
    pub id: String,
    pub item_type: OutboxItemType,
    /// FIFO stream key within the item type. None/empty means "default".
    pub message_group: Option<String>,
    /// Opaque JSON text.
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    /// Set by the producer at insertion, never mutated afterwards.
    pub created_at: DateTime<Utc>,
    /// Refreshed on every status write. None until the first write.
    pub updated_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl OutboxItem {
    /// Normalized message group key: empty or absent groups collapse to
    /// [`DEFAULT_MESSAGE_GROUP`].
    pub fn group_key(&self) -> &str {
        match self.message_group.as_deref() {
            Some(g) if !g.is_empty() => g,
            _ => DEFAULT_MESSAGE_GROUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Success,
            OutboxStatus::BadRequest,
            OutboxStatus::InternalError,
            OutboxStatus::Unauthorized,
            OutboxStatus::Forbidden,
            OutboxStatus::GatewayError,
            OutboxStatus::InProgress,
        ] {
            assert_eq!(OutboxStatus::from_code(status.code()), status);
        }
    }

    #[test]
    fn unknown_code_defaults_to_pending() {
        assert_eq!(OutboxStatus::from_code(42), OutboxStatus::Pending);
    }

    #[test]
    fn recoverable_set_excludes_pending_and_success() {
        assert!(!OutboxStatus::Pending.is_recoverable());
        assert!(!OutboxStatus::Success.is_recoverable());
        assert!(OutboxStatus::InProgress.is_recoverable());
        assert!(OutboxStatus::BadRequest.is_recoverable());
        assert!(OutboxStatus::GatewayError.is_recoverable());
        assert_eq!(OutboxStatus::recoverable_codes().len(), 6);
    }

    #[test]
    fn group_key_normalizes_empty_groups() {
        let mut item = OutboxItem {
            id: "01ABC".to_string(),
            item_type: OutboxItemType::Event,
            message_group: None,
            payload: "{}".to_string(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: None,
            error_message: None,
        };
        assert_eq!(item.group_key(), "default");
        item.message_group = Some(String::new());
        assert_eq!(item.group_key(), "default");
        item.message_group = Some("orders".to_string());
        assert_eq!(item.group_key(), "orders");
    }

    #[test]
    fn item_type_endpoints() {
        assert_eq!(OutboxItemType::Event.api_path(), "/api/events/batch");
        assert_eq!(OutboxItemType::DispatchJob.api_path(), "/api/dispatch/jobs/batch");
    }

    #[test]
    fn item_type_parses_variants() {
        assert_eq!("event".parse::<OutboxItemType>(), Ok(OutboxItemType::Event));
        assert_eq!("dispatch_job".parse::<OutboxItemType>(), Ok(OutboxItemType::DispatchJob));
        assert!("webhook".parse::<OutboxItemType>().is_err());
    }
}
