//! Resource ownership verification.
//!
//! Users can only act on their own sessions and recommendations. Each gate
//! fetches the resource, applies the ownership matrix and attaches the row
//! to request extensions for the downstream handler.
//!
//! Error precedence is uniform: a missing resource is always `not_found`,
//! for every caller, before any ownership comparison. Denials are logged as
//! security events with masked identifiers.

use axum::{
    body::Body,
    extract::{Path, State},
    http::Request,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::db::{Recommendation, Session};
use crate::utils::mask_user_id;
use crate::AppState;

/// The ownership matrix shared by every gate:
/// - authenticated + owner matches        -> allow
/// - authenticated + owner differs        -> forbidden
/// - anonymous + unowned resource         -> allow (pre-login flows)
/// - anonymous + owned resource           -> forbidden
/// - any caller + unowned resource        -> allow
fn authorize_owner(
    identity: Option<&AuthUser>,
    owner: Option<&str>,
    resource: &str,
    resource_id: &str,
) -> Result<(), ApiError> {
    match (identity, owner) {
        (_, None) => Ok(()),
        (Some(user), Some(owner)) if user.user_id == owner => Ok(()),
        (Some(user), Some(owner)) => {
            warn!(
                caller = %mask_user_id(&user.user_id),
                owner = %mask_user_id(owner),
                resource = resource,
                id = %mask_user_id(resource_id),
                "Ownership denial"
            );
            Err(ApiError::forbidden(format!(
                "Access denied: you can only access your own {resource}s"
            )))
        }
        (None, Some(owner)) => {
            warn!(
                owner = %mask_user_id(owner),
                resource = resource,
                id = %mask_user_id(resource_id),
                "Anonymous access to owned resource denied"
            );
            Err(ApiError::forbidden(format!(
                "Access denied: you can only access your own {resource}s"
            )))
        }
    }
}

/// Gate for routes addressing a session directly.
pub async fn verify_session_ownership(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = request.extensions().get::<AuthUser>().cloned();

    let session = Session::find_by_id(&state.db, &session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Session not found"))?;

    authorize_owner(
        identity.as_ref(),
        session.user_id.as_deref(),
        "session",
        &session.id,
    )?;

    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}

/// Gate for routes addressing a recommendation. Ownership resolves
/// transitively through the parent session.
pub async fn verify_recommendation_ownership(
    State(state): State<Arc<AppState>>,
    Path(recommendation_id): Path<String>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = request.extensions().get::<AuthUser>().cloned();

    let recommendation = Recommendation::find_by_id(&state.db, &recommendation_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Recommendation not found"))?;

    let session = Session::find_by_id(&state.db, &recommendation.session_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Associated session not found"))?;

    authorize_owner(
        identity.as_ref(),
        session.user_id.as_deref(),
        "recommendation",
        &recommendation.id,
    )?;

    request.extensions_mut().insert(recommendation);
    Ok(next.run(request).await)
}

/// Creation-time gate. Anonymous creation is allowed; an authenticated
/// caller supplying an existing session id must still own it, so one
/// identity cannot silently hijack another's in-flight session.
pub async fn verify_session_creation_auth(
    State(state): State<Arc<AppState>>,
    session_id: Option<Path<String>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = request.extensions().get::<AuthUser>().cloned();

    if let (Some(user), Some(Path(session_id))) = (identity.as_ref(), session_id) {
        if let Some(session) = Session::find_by_id(&state.db, &session_id).await? {
            if let Some(owner) = session.user_id.as_deref() {
                if owner != user.user_id {
                    warn!(
                        caller = %mask_user_id(&user.user_id),
                        owner = %mask_user_id(owner),
                        id = %mask_user_id(&session.id),
                        "Session hijack attempt denied"
                    );
                    return Err(ApiError::forbidden(
                        "Access denied: you can only modify your own sessions",
                    ));
                }
            }
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ErrorCode;
    use crate::db::Role;

    fn user(id: &str) -> AuthUser {
        AuthUser {
            user_id: id.to_string(),
            role: Role::User,
        }
    }

    #[test]
    fn owner_is_allowed() {
        assert!(authorize_owner(Some(&user("a")), Some("a"), "session", "s1").is_ok());
    }

    #[test]
    fn other_user_is_forbidden() {
        let err = authorize_owner(Some(&user("b")), Some("a"), "session", "s1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[test]
    fn anonymous_can_reach_unowned_resource() {
        assert!(authorize_owner(None, None, "session", "s1").is_ok());
    }

    #[test]
    fn anonymous_is_forbidden_from_owned_resource() {
        let err = authorize_owner(None, Some("a"), "session", "s1").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
    }

    #[test]
    fn authenticated_can_reach_unowned_resource() {
        assert!(authorize_owner(Some(&user("a")), None, "session", "s1").is_ok());
    }
}
