pub mod auth;
pub mod authorization;
pub mod cleanup;
pub mod csrf;
pub mod error;
pub mod rate_limit;
mod sessions;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

/// Build the full application router.
///
/// Request flow on sensitive routes: rate limiter (outermost), then CSRF
/// guard on mutating methods, then the authentication gate, then ownership,
/// then the handler. The CSRF guard itself lets read-only methods through.
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_routes = Router::new()
        .route(
            "/signup",
            post(auth::signup)
                .layer(from_fn(csrf::csrf_protection))
                .layer(from_fn_with_state(
                    state.clone(),
                    rate_limit::rate_limit_signup,
                )),
        )
        .route(
            "/login",
            post(auth::login)
                .layer(from_fn(csrf::csrf_protection))
                .layer(from_fn_with_state(
                    state.clone(),
                    rate_limit::rate_limit_login,
                )),
        )
        .route("/refresh", post(auth::refresh))
        .route(
            "/logout",
            post(auth::logout)
                .layer(from_fn_with_state(state.clone(), auth::authenticate_user))
                .layer(from_fn(csrf::csrf_protection)),
        )
        .route(
            "/me",
            get(auth::me).layer(from_fn_with_state(state.clone(), auth::authenticate_user)),
        )
        .route("/verify-email", post(auth::verify_email))
        .route(
            "/forgot-password",
            post(auth::forgot_password).layer(from_fn_with_state(
                state.clone(),
                rate_limit::rate_limit_password_reset,
            )),
        )
        .route("/reset-password", post(auth::reset_password));

    // Ownership-gated resource routes. The CSRF guard wraps the whole
    // method chain and passes read-only methods through untouched.
    let resource_routes = Router::new()
        // Session creation is deliberately outside the CSRF guard: a
        // pre-login client has never held a CSRF pair. The creation-time
        // ownership gate still protects owned session ids.
        .route(
            "/sessions",
            post(sessions::create_session)
                .layer(from_fn_with_state(
                    state.clone(),
                    authorization::verify_session_creation_auth,
                ))
                .layer(from_fn_with_state(state.clone(), auth::optional_auth)),
        )
        .route(
            "/sessions/:session_id",
            get(sessions::get_session)
                .put(sessions::update_session)
                .delete(sessions::delete_session)
                .layer(from_fn_with_state(
                    state.clone(),
                    authorization::verify_session_ownership,
                ))
                .layer(from_fn_with_state(state.clone(), auth::optional_auth))
                .layer(from_fn(csrf::csrf_protection)),
        )
        .route(
            "/recommendations/:recommendation_id",
            get(sessions::get_recommendation)
                .layer(from_fn_with_state(
                    state.clone(),
                    authorization::verify_recommendation_ownership,
                ))
                .layer(from_fn_with_state(state.clone(), auth::optional_auth)),
        );

    // Operator-only routes, gated by the static admin key.
    let admin_routes = Router::new()
        .route("/cleanup/status", get(cleanup::cleanup_status))
        .route("/cleanup/health", get(cleanup::cleanup_health))
        .route("/cleanup/run", post(cleanup::run_cleanup))
        .route_layer(from_fn_with_state(state.clone(), auth::authenticate_admin));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .route("/csrf-token", get(csrf::get_csrf_token))
        .merge(resource_routes)
        .nest("/admin", admin_routes)
        .layer(from_fn_with_state(state.clone(), rate_limit::rate_limit_api));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}
