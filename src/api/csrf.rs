//! CSRF protection middleware and token endpoint.
//!
//! Double-submit: the secret rides in an HTTP-only cookie, the derived
//! token is echoed back by the client in the `x-csrf-token` header on every
//! mutating request. Read-only methods bypass the guard entirely.

use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    middleware::Next,
    response::Response,
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Serialize;
use std::sync::Arc;
use time::Duration as CookieDuration;
use tracing::debug;

use crate::api::error::ApiError;
use crate::auth::csrf;
use crate::AppState;

pub const CSRF_SECRET_COOKIE: &str = "csrf_secret";
const CSRF_TOKEN_HEADER: &str = "x-csrf-token";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
}

/// Gate applied to state-mutating routes.
pub async fn csrf_protection(
    jar: CookieJar,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    // Read-only requests cannot mutate state; let them through.
    let method = request.method();
    if method == Method::GET || method == Method::HEAD || method == Method::OPTIONS {
        debug!("CSRF bypass for read-only request");
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get(CSRF_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());
    let secret = jar.get(CSRF_SECRET_COOKIE).map(|c| c.value().to_string());

    let (Some(token), Some(secret)) = (token, secret) else {
        return Err(ApiError::csrf_missing());
    };

    if !csrf::verify(&secret, token) {
        return Err(ApiError::csrf_invalid());
    }

    Ok(next.run(request).await)
}

/// GET /api/csrf-token
///
/// Issues a fresh pair: secret into the HTTP-only cookie, derived token in
/// the body for the client to echo back.
pub async fn get_csrf_token(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> (CookieJar, Json<CsrfTokenResponse>) {
    let pair = csrf::issue();
    let environment = state.config.auth.environment;

    let cookie = Cookie::build((CSRF_SECRET_COOKIE, pair.secret))
        .http_only(true)
        .secure(environment.is_production())
        .same_site(if environment.is_production() {
            SameSite::Strict
        } else {
            SameSite::Lax
        })
        .path("/")
        .max_age(CookieDuration::hours(csrf::CSRF_TTL_HOURS))
        .build();

    (
        jar.add(cookie),
        Json(CsrfTokenResponse {
            csrf_token: pair.token,
        }),
    )
}
