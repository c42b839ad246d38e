//! Operational endpoints for the token cleanup scheduler.
//!
//! All routes here sit behind the static-key admin gate.

use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::api::error::ApiError;
use crate::engine::token_cleanup::{CleanupHealth, CleanupStats, CleanupStatus};
use crate::AppState;

/// GET /api/admin/cleanup/status
pub async fn cleanup_status(State(state): State<Arc<AppState>>) -> Json<CleanupStatus> {
    Json(state.cleanup.status())
}

/// GET /api/admin/cleanup/health
pub async fn cleanup_health(State(state): State<Arc<AppState>>) -> Json<CleanupHealth> {
    Json(state.cleanup.health())
}

/// POST /api/admin/cleanup/run
///
/// Forced manual run. Goes through the same re-entrancy guard as the
/// scheduler: an already-running sweep is reported, not queued behind.
pub async fn run_cleanup(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CleanupStats>, ApiError> {
    info!("Manual token cleanup requested");

    match state.cleanup.run().await {
        Ok(Some(stats)) => Ok(Json(stats)),
        Ok(None) => Err(ApiError::conflict("A cleanup run is already in progress")),
        Err(e) => Err(ApiError::internal(format!("Cleanup run failed: {e}"))),
    }
}
