//! Internal HTTP surface: the scheduler's sync trigger and a health
//! check. User-facing HTTP lives in the API layer, not here.

use crate::connections::{ConnectionRepo, SyncStatus};
use crate::sync::{SyncQueue, SyncTask};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct GatewayState {
    api_key: Arc<String>,
    repo: ConnectionRepo,
    queue: Arc<dyn SyncQueue>,
}

impl GatewayState {
    pub fn new(api_key: String, repo: ConnectionRepo, queue: Arc<dyn SyncQueue>) -> Self {
        Self {
            api_key: Arc::new(api_key),
            repo,
            queue,
        }
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/trigger-sync", post(trigger_sync_handler))
        .route("/healthz", get(health_handler))
        .with_state(state)
}

/// Bind and serve until the process shuts down.
pub async fn serve(listener: TcpListener, state: GatewayState) -> anyhow::Result<()> {
    info!("gateway listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(json!({"status": "ok", "version": crate::VERSION}))
}

/// POST /trigger-sync: shared-secret authenticated, replies 202
/// immediately and fans out in the background.
async fn trigger_sync_handler(
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let presented = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !valid_api_key(&state.api_key, presented) {
        warn!("trigger-sync rejected: bad or missing api key");
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({"error": "unauthorized"})),
        );
    }

    tokio::spawn(fan_out(state));
    (
        StatusCode::ACCEPTED,
        axum::Json(json!({"status": "accepted"})),
    )
}

/// Constant-time comparison so the key cannot be probed byte by byte.
fn valid_api_key(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Enqueue one task per enabled connection across all users, skipping
/// connections with a sync already in flight.
async fn fan_out(state: GatewayState) {
    let connections = match state.repo.enabled().await {
        Ok(connections) => connections,
        Err(e) => {
            warn!("trigger-sync fan-out could not list connections: {e}");
            return;
        }
    };

    let mut enqueued = 0usize;
    for connection in connections {
        match state.repo.sync_state(&connection.id).await {
            Ok(Some(sync_state)) if sync_state.status == SyncStatus::Syncing => {
                debug!("skipping {}: sync already in flight", connection.id);
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("could not read sync state for {}: {e}", connection.id);
                continue;
            }
        }
        if let Err(e) = state
            .queue
            .enqueue(SyncTask::new(&connection.id, &connection.user_id))
            .await
        {
            warn!("failed to enqueue sync for {}: {e}", connection.id);
            continue;
        }
        enqueued += 1;
    }
    info!("trigger-sync enqueued {enqueued} task(s)");
}
