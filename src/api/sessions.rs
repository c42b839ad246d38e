//! Session and recommendation endpoints.
//!
//! The real CRUD surface for these resources lives in the surrounding
//! application; the handlers here are the thin read/create/delete paths the
//! ownership gates are mounted on. Each ownership-gated handler receives the
//! resource already fetched and authorized by the middleware.

use axum::{extract::State, http::StatusCode, Extension, Json};
use std::sync::Arc;
use tracing::info;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::db::{Recommendation, Session};
use crate::utils::mask_user_id;
use crate::AppState;

/// POST /api/sessions
///
/// Anonymous creation is allowed; an authenticated caller becomes the owner.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    identity: Option<Extension<AuthUser>>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let owner = identity.as_ref().map(|Extension(auth)| auth.user_id.as_str());
    let session = Session::create(&state.db, owner).await?;

    info!(
        session = %mask_user_id(&session.id),
        owner = owner.map(mask_user_id).unwrap_or_else(|| "anonymous".to_string()),
        "Session created"
    );

    Ok((StatusCode::CREATED, Json(session)))
}

/// GET /api/sessions/:session_id
pub async fn get_session(Extension(session): Extension<Session>) -> Json<Session> {
    Json(session)
}

/// PUT /api/sessions/:session_id
///
/// The real update surface lives in the CRUD layer; this touch keeps the
/// gated mutating path exercisable end to end.
pub async fn update_session(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<Json<Session>, ApiError> {
    sqlx::query("UPDATE sessions SET updated_at = datetime('now') WHERE id = ?")
        .bind(&session.id)
        .execute(&state.db)
        .await?;

    let refreshed = Session::find_by_id(&state.db, &session.id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;
    Ok(Json(refreshed))
}

/// DELETE /api/sessions/:session_id
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Session>,
) -> Result<StatusCode, ApiError> {
    sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(&session.id)
        .execute(&state.db)
        .await?;

    info!(session = %mask_user_id(&session.id), "Session deleted");

    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/recommendations/:recommendation_id
pub async fn get_recommendation(
    Extension(recommendation): Extension<Recommendation>,
) -> Json<Recommendation> {
    Json(recommendation)
}
