//! Admin API for the search index synchronizer

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use search_indexer::{ConsumerStats, ConsumerStatsSnapshot};
use search_sync_core::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Admin API state
#[derive(Clone)]
pub struct AdminState {
    pub health: SyncHealth,
    pub stats: Arc<ConsumerStats>,
    pub store: Arc<dyn IndexStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
}

/// Health response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub bootstrap: BootstrapState,
    pub upstream_stalled: bool,
}

/// Readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub bootstrap: BootstrapState,
}

/// Stats response
#[derive(Serialize)]
pub struct StatsResponse {
    pub consumer: ConsumerStatsSnapshot,
    pub index_backend: &'static str,
    pub index_items: Option<usize>,
    pub dead_letter_sink: &'static str,
    pub dead_letters: Option<usize>,
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    let bootstrap = state.health.current();
    let upstream_stalled = state.health.is_stalled();
    let status = match bootstrap {
        BootstrapState::Failed { .. } => "degraded",
        _ if upstream_stalled => "degraded",
        _ => "healthy",
    };
    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        bootstrap,
        upstream_stalled,
    })
}

async fn live() -> &'static str {
    "OK"
}

async fn ready(State(state): State<AdminState>) -> (StatusCode, Json<ReadinessResponse>) {
    let bootstrap = state.health.current();
    let ready = bootstrap.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, bootstrap }))
}

async fn stats(State(state): State<AdminState>) -> Json<StatsResponse> {
    let index_items = match state.store.count().await {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(error = %e, "Failed to count index items");
            None
        }
    };
    Json(StatsResponse {
        consumer: state.stats.snapshot(),
        index_backend: state.store.name(),
        index_items,
        dead_letter_sink: state.dead_letters.name(),
        dead_letters: state.dead_letters.len().await,
    })
}

/// Admin routes
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Run admin server until `cancel` fires
pub async fn run_admin_server(
    listen: String,
    state: AdminState,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .map_err(|e| SyncError::config(format!("Cannot bind admin API to {}: {}", listen, e)))?;
    info!(listen, "Admin API started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| SyncError::Internal(format!("Admin API failed: {}", e)))?;

    info!("Admin API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use search_indexer::DeadLetterQueue;
    use search_sync_core::MemoryIndexStore;
    use serde_json::json;

    fn state() -> AdminState {
        AdminState {
            health: SyncHealth::new(),
            stats: Arc::new(ConsumerStats::default()),
            store: Arc::new(MemoryIndexStore::with_items(vec![Item::new("A1", 1, json!("Watch"))])),
            dead_letters: Arc::new(DeadLetterQueue::new(10)),
        }
    }

    #[tokio::test]
    async fn test_ready_is_503_until_bootstrap_ready() {
        let state = state();

        let (status, Json(body)) = ready(State(state.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.ready);

        state.health.set(BootstrapState::Ready {
            items: 1,
            skipped: false,
            at: Utc::now(),
        });
        let (status, Json(body)) = ready(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ready);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_when_stalled() {
        let state = state();
        state.health.set_stalled(true);

        let Json(body) = health(State(state)).await;
        assert_eq!(body.status, "degraded");
        assert!(body.upstream_stalled);
    }

    #[tokio::test]
    async fn test_stats_include_index_and_dead_letters() {
        let Json(body) = stats(State(state())).await;
        assert_eq!(body.index_backend, "memory_index");
        assert_eq!(body.index_items, Some(1));
        assert_eq!(body.dead_letters, Some(0));

        let encoded = serde_json::to_value(&body).unwrap();
        assert_eq!(encoded["consumer"]["processed"], 0);
    }
}
