//! Batch API client.
//!
//! Posts batches of outbox items to the downstream endpoints
//! (`/api/events/batch`, `/api/dispatch/jobs/batch`) and maps the HTTP
//! response onto one outbox status per item. The response contract is
//! whole-batch: one status code decides the fate of every id in the request.
//! [`BatchResult`] still carries one outcome per id, in request order, so a
//! per-item response mapping can be added without touching the processors.

use std::time::Duration;

use async_trait::async_trait;
use rb_common::{OutboxItem, OutboxItemType, OutboxStatus};
use serde::Serialize;
use tracing::{debug, error, warn};

/// Batch API client configuration.
#[derive(Debug, Clone)]
pub struct BatchApiConfig {
    /// Base URL of the downstream API.
    pub api_base_url: String,
    /// Optional Bearer token.
    pub api_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for BatchApiConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            api_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Outcome for one item of a submitted batch.
#[derive(Debug, Clone)]
pub struct ItemOutcome {
    pub id: String,
    pub status: OutboxStatus,
    pub error_message: Option<String>,
}

/// Per-item outcomes of one batch submission, in request order.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub outcomes: Vec<ItemOutcome>,
}

impl BatchResult {
    /// Build a result assigning the same fate to every item of the batch.
    pub fn uniform(items: &[OutboxItem], status: OutboxStatus, error: Option<String>) -> Self {
        Self {
            outcomes: items
                .iter()
                .map(|item| ItemOutcome {
                    id: item.id.clone(),
                    status,
                    error_message: error.clone(),
                })
                .collect(),
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == OutboxStatus::Success)
    }
}

/// Seam between the group processors and the remote API.
#[async_trait]
pub trait BatchApi: Send + Sync {
    /// Submit one batch. Never fails: transport and protocol errors are
    /// folded into the per-item statuses.
    async fn submit_batch(&self, item_type: OutboxItemType, items: &[OutboxItem]) -> BatchResult;
}

/// Request body: parsed payloads plus the ordered id list.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    ids: Vec<String>,
    items: Vec<serde_json::Value>,
}

/// HTTP implementation of [`BatchApi`].
pub struct HttpBatchApiClient {
    config: BatchApiConfig,
    client: reqwest::Client,
}

impl HttpBatchApiClient {
    pub fn new(config: BatchApiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { config, client })
    }

    fn endpoint_for_type(&self, item_type: OutboxItemType) -> String {
        format!("{}{}", self.config.api_base_url, item_type.api_path())
    }

    /// HTTP status → outbox status. 2xx is handled before this is called.
    fn map_error_status(status: reqwest::StatusCode) -> OutboxStatus {
        match status.as_u16() {
            400 | 422 => OutboxStatus::BadRequest,
            401 => OutboxStatus::Unauthorized,
            403 => OutboxStatus::Forbidden,
            502 | 503 | 504 => OutboxStatus::GatewayError,
            code if (400..500).contains(&code) => OutboxStatus::BadRequest,
            _ => OutboxStatus::InternalError,
        }
    }
}

#[async_trait]
impl BatchApi for HttpBatchApiClient {
    async fn submit_batch(&self, item_type: OutboxItemType, items: &[OutboxItem]) -> BatchResult {
        if items.is_empty() {
            return BatchResult::default();
        }

        // Payloads are stored as opaque text; parse them here so a corrupt
        // row fails its batch instead of poisoning the poll.
        let mut payloads = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_str::<serde_json::Value>(&item.payload) {
                Ok(value) => payloads.push(value),
                Err(e) => {
                    error!(id = %item.id, error = %e, "Unparseable outbox payload");
                    return BatchResult::uniform(
                        items,
                        OutboxStatus::InternalError,
                        Some(format!("payload parse error for {}: {}", item.id, e)),
                    );
                }
            }
        }

        let body = BatchRequest {
            ids: items.iter().map(|i| i.id.clone()).collect(),
            items: payloads,
        };

        let url = self.endpoint_for_type(item_type);
        debug!(count = items.len(), %url, "Submitting outbox batch");

        let mut request = self.client.post(&url).json(&body);
        if let Some(ref token) = self.config.api_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    BatchResult::uniform(items, OutboxStatus::Success, None)
                } else {
                    let outbox_status = Self::map_error_status(status);
                    let error_body = response.text().await.unwrap_or_default();
                    warn!(
                        http_status = %status,
                        outbox_status = ?outbox_status,
                        "Batch request rejected"
                    );
                    BatchResult::uniform(
                        items,
                        outbox_status,
                        Some(format!("HTTP {}: {}", status, error_body)),
                    )
                }
            }
            Err(e) => {
                // Timeouts, connection failures and other transport errors
                // all share gateway semantics: retriable after recovery.
                error!(error = %e, "Batch request failed");
                BatchResult::uniform(items, OutboxStatus::GatewayError, Some(e.to_string()))
            }
        }
    }
}
