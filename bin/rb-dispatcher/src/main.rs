//! Relaybox outbox dispatcher service.
//!
//! Drains application outbox tables and delivers rows to the downstream
//! batch API with per-group FIFO ordering. Runs standalone or as one of
//! several replicas with Redis leader election.
//!
//! Configuration comes from `relaybox.toml` (or `RELAYBOX_CONFIG`) with
//! `RELAYBOX_*` environment overrides; see the rb-config crate for the full
//! variable list. The service exposes `/health`, `/ready` and `/metrics` on
//! the configured HTTP port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::State;
use tokio::signal;
use tracing::{error, info};

use rb_config::{AppConfig, ConfigLoader};
use rb_outbox::{
    BatchApiConfig, DispatcherConfig, HttpBatchApiClient, OutboxDispatcher, OutboxRepository,
    OutboxTableConfig, PostgresOutboxRepository, SqliteOutboxRepository,
};
use rb_standby::{RedisLeaseLock, StandbyConfig, StandbyService};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    rb_common::logging::init_logging("rb-dispatcher");

    info!("Starting Relaybox outbox dispatcher");

    let config = ConfigLoader::new().load()?;

    let repository = create_outbox_repository(&config).await?;
    info!(driver = %config.database.driver, "Outbox repository initialized");

    let api = Arc::new(HttpBatchApiClient::new(BatchApiConfig {
        api_base_url: config.outbox.api_base_url.clone(),
        api_token: config.outbox.api_token.clone(),
        connect_timeout: Duration::from_millis(config.outbox.connect_timeout_ms),
        request_timeout: Duration::from_millis(config.outbox.request_timeout_ms),
    })?);

    let dispatcher = Arc::new(OutboxDispatcher::new(
        dispatcher_config(&config),
        Arc::clone(&repository),
        api,
    ));

    // Leader election, when enabled. Without it this instance is always
    // primary.
    let standby = if config.standby.enabled {
        let lock = RedisLeaseLock::connect(
            &config.standby.redis_url,
            config.standby.lock_key.clone(),
            config.standby.instance_id.clone(),
        )
        .await?;

        let service = Arc::new(StandbyService::new(
            StandbyConfig {
                lock_ttl: Duration::from_secs(config.standby.lock_ttl_seconds),
                refresh_interval: Duration::from_secs(config.standby.refresh_interval_seconds),
                instance_id: config.standby.instance_id.clone(),
            },
            Arc::new(lock),
        )?);
        Arc::clone(&service).start()?;

        info!(
            lock_key = %config.standby.lock_key,
            instance_id = %config.standby.instance_id,
            "Leader election enabled"
        );
        Some(service)
    } else {
        None
    };

    let dispatcher_handle = {
        let dispatcher = Arc::clone(&dispatcher);
        let standby = standby.clone();
        tokio::spawn(async move {
            let result = match standby {
                Some(standby) => dispatcher.start_with_standby(standby).await,
                None => dispatcher.start().await,
            };
            if let Err(e) = result {
                error!(error = %e, "Outbox dispatcher exited with error");
            }
        })
    };

    // Health and metrics endpoints.
    let addr: SocketAddr = format!("{}:{}", config.http.host, config.http.port).parse()?;
    let app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .route("/metrics", axum::routing::get(metrics_handler))
        .with_state(AppState {
            dispatcher: Arc::clone(&dispatcher),
            repository: Arc::clone(&repository),
        });

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP endpoints listening on http://{}", addr);

    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "HTTP server exited with error");
        }
    });

    info!("Relaybox outbox dispatcher started, press Ctrl+C to stop");

    shutdown_signal().await;
    info!("Shutdown signal received");

    dispatcher.shutdown();
    if let Some(standby) = &standby {
        standby.shutdown();
    }
    http_handle.abort();

    // Give in-flight batches time to finish before the process exits.
    let _ = tokio::time::timeout(Duration::from_secs(30), dispatcher_handle).await;

    info!("Relaybox outbox dispatcher shutdown complete");
    Ok(())
}

fn dispatcher_config(config: &AppConfig) -> DispatcherConfig {
    DispatcherConfig {
        enabled: config.outbox.enabled,
        poll_interval: Duration::from_millis(config.outbox.poll_interval_ms),
        recovery_interval: Duration::from_millis(config.outbox.recovery_interval_ms),
        poll_batch_size: config.outbox.poll_batch_size,
        api_batch_size: config.outbox.api_batch_size,
        batch_linger: Duration::from_millis(config.outbox.batch_linger_ms),
        max_in_flight: config.outbox.max_in_flight,
        global_buffer_size: config.outbox.global_buffer_size,
        max_concurrent_groups: config.outbox.max_concurrent_groups,
        group_queue_capacity: config.outbox.group_queue_capacity,
        processing_timeout: Duration::from_secs(config.outbox.processing_timeout_seconds),
        ..Default::default()
    }
}

async fn create_outbox_repository(config: &AppConfig) -> Result<Arc<dyn OutboxRepository>> {
    let table_config = OutboxTableConfig {
        events_table: config.outbox.events_table.clone(),
        dispatch_jobs_table: config.outbox.dispatch_jobs_table.clone(),
    };

    match config.database.driver.as_str() {
        "sqlite" => {
            let pool = SqlitePoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&config.database.url)
                .await?;
            let repo = SqliteOutboxRepository::with_config(pool, table_config);
            repo.create_schema().await?;
            info!(url = %config.database.url, "Using SQLite outbox");
            Ok(Arc::new(repo))
        }
        "postgres" => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database.max_connections)
                .connect(&config.database.url)
                .await?;
            let repo = PostgresOutboxRepository::with_config(pool, table_config);
            repo.create_schema().await?;
            info!("Using PostgreSQL outbox");
            Ok(Arc::new(repo))
        }
        other => Err(anyhow::anyhow!(
            "Unknown database driver: {}. Use sqlite or postgres",
            other
        )),
    }
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<OutboxDispatcher>,
    repository: Arc<dyn OutboxRepository>,
}

async fn health_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler(State(state): State<AppState>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": if state.dispatcher.is_running() { "READY" } else { "STARTING" },
        "primary": state.dispatcher.is_primary()
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    let m = state.dispatcher.metrics().await;
    let pending_events = state
        .repository
        .count_pending(rb_common::OutboxItemType::Event)
        .await
        .unwrap_or(0);
    let pending_jobs = state
        .repository
        .count_pending(rb_common::OutboxItemType::DispatchJob)
        .await
        .unwrap_or(0);
    format!(
        "# HELP relaybox_outbox_items_polled_total Rows fetched from the outbox tables\n\
         # TYPE relaybox_outbox_items_polled_total counter\n\
         relaybox_outbox_items_polled_total {}\n\
         # HELP relaybox_outbox_items_succeeded_total Rows delivered successfully\n\
         # TYPE relaybox_outbox_items_succeeded_total counter\n\
         relaybox_outbox_items_succeeded_total {}\n\
         # HELP relaybox_outbox_items_failed_total Rows written with an error status\n\
         # TYPE relaybox_outbox_items_failed_total counter\n\
         relaybox_outbox_items_failed_total {}\n\
         # HELP relaybox_outbox_items_recovered_total Rows rewound to pending by recovery\n\
         # TYPE relaybox_outbox_items_recovered_total counter\n\
         relaybox_outbox_items_recovered_total {}\n\
         # HELP relaybox_outbox_buffer_rejected_total Rows refused by the global buffer\n\
         # TYPE relaybox_outbox_buffer_rejected_total counter\n\
         relaybox_outbox_buffer_rejected_total {}\n\
         # HELP relaybox_outbox_in_flight Items inside the pipeline\n\
         # TYPE relaybox_outbox_in_flight gauge\n\
         relaybox_outbox_in_flight {}\n\
         # HELP relaybox_outbox_active_groups Live message group workers\n\
         # TYPE relaybox_outbox_active_groups gauge\n\
         relaybox_outbox_active_groups {}\n\
         # HELP relaybox_outbox_pending Pending rows per item type\n\
         # TYPE relaybox_outbox_pending gauge\n\
         relaybox_outbox_pending{{type=\"EVENT\"}} {}\n\
         relaybox_outbox_pending{{type=\"DISPATCH_JOB\"}} {}\n",
        m.items_polled,
        m.items_succeeded,
        m.items_failed,
        m.items_recovered,
        m.buffer_rejected,
        m.in_flight,
        m.active_groups,
        pending_events,
        pending_jobs
    )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
