//! End-to-end flows over the full router with an in-memory store:
//! signup → verify → login → refresh → logout, the rotation and revocation
//! invariants, ownership checks, CSRF enforcement and the admin gate.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use tower::ServiceExt;

use keygate::config::{Config, Environment, Secrets};
use keygate::db::{RefreshToken, Role};
use keygate::notifications::LogMailer;
use keygate::AppState;

const ADMIN_KEY: &str = "test-admin-key-for-operator-routes";

async fn spawn_app() -> (Router, Arc<AppState>) {
    let mut config = Config::default();
    config.auth.environment = Environment::Development;
    config.cleanup.enabled = Some(false);

    let secrets = Secrets {
        access: "integration-access-secret-0123456789ab".to_string(),
        refresh: "integration-refresh-secret-0123456789a".to_string(),
        admin_api_key: ADMIN_KEY.to_string(),
    };

    let db = keygate::db::init_in_memory().await.unwrap();
    let state = Arc::new(AppState::new(config, secrets, db, Arc::new(LogMailer)));
    (keygate::api::create_router(state.clone()), state)
}

/// Pull `name=value` out of a response's Set-Cookie headers.
fn cookie_value(response: &axum::response::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .find_map(|raw| {
            let pair = raw.split(';').next()?;
            let (k, v) = pair.split_once('=')?;
            (k.trim() == name && !v.is_empty()).then(|| v.to_string())
        })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

struct CsrfPair {
    cookie: String,
    token: String,
}

async fn fetch_csrf(app: &Router) -> CsrfPair {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/csrf-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = cookie_value(&response, "csrf_secret").unwrap();
    let json = body_json(response).await;
    CsrfPair {
        cookie,
        token: json["csrfToken"].as_str().unwrap().to_string(),
    }
}

fn json_request(
    method: Method,
    uri: &str,
    body: serde_json::Value,
    cookies: &[(&str, &str)],
    headers: &[(&str, &str)],
) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if !cookies.is_empty() {
        let cookie_header = cookies
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        builder = builder.header(header::COOKIE, cookie_header);
    }
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn signup_and_verify(app: &Router, state: &AppState, email: &str) {
    let csrf = fetch_csrf(app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/signup",
            serde_json::json!({"email": email, "password": "sunny day 42", "name": "Alice"}),
            &[("csrf_secret", &csrf.cookie)],
            &[("x-csrf-token", &csrf.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let (token,): (String,) =
        sqlx::query_as("SELECT verification_token FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(&state.db)
            .await
            .unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/verify-email",
            serde_json::json!({"token": token}),
            &[],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

struct LoginCookies {
    access: String,
    refresh: String,
}

async fn login(app: &Router, email: &str, password: &str) -> LoginCookies {
    let csrf = fetch_csrf(app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/login",
            serde_json::json!({"email": email, "password": password}),
            &[("csrf_secret", &csrf.cookie)],
            &[("x-csrf-token", &csrf.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    LoginCookies {
        access: cookie_value(&response, "access_token").unwrap(),
        refresh: cookie_value(&response, "refresh_token").unwrap(),
    }
}

#[tokio::test]
async fn full_account_lifecycle() {
    let (app, state) = spawn_app().await;

    signup_and_verify(&app, &state, "alice@example.com").await;

    // Unverified state was cleared by verification; login works.
    let first = login(&app, "alice@example.com", "sunny day 42").await;

    // Refresh once: succeeds and rotates.
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/refresh",
            serde_json::json!({}),
            &[("refresh_token", &first.refresh)],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let second_refresh = cookie_value(&response, "refresh_token").unwrap();
    assert_ne!(second_refresh, first.refresh);

    // Re-presenting the rotated-away token fails.
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/refresh",
            serde_json::json!({}),
            &[("refresh_token", &first.refresh)],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "invalid_refresh_token");

    // Logout deletes the active line...
    let csrf = fetch_csrf(&app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/logout",
            serde_json::json!({}),
            &[
                ("csrf_secret", &csrf.cookie),
                ("access_token", &first.access),
                ("refresh_token", &second_refresh),
            ],
            &[("x-csrf-token", &csrf.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // ...so the surviving refresh token is dead too.
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/refresh",
            serde_json::json!({}),
            &[("refresh_token", &second_refresh)],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_requires_verified_email() {
    let (app, _state) = spawn_app().await;

    let csrf = fetch_csrf(&app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/signup",
            serde_json::json!({"email": "bob@example.com", "password": "rainy day 42", "name": "Bob"}),
            &[("csrf_secret", &csrf.cookie)],
            &[("x-csrf-token", &csrf.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let csrf = fetch_csrf(&app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/login",
            serde_json::json!({"email": "bob@example.com", "password": "rainy day 42"}),
            &[("csrf_secret", &csrf.cookie)],
            &[("x-csrf-token", &csrf.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn second_login_revokes_the_first_refresh_line() {
    let (app, _state) = spawn_app().await;
    signup_and_verify(&app, &_state, "alice@example.com").await;

    let first = login(&app, "alice@example.com", "sunny day 42").await;
    let _second = login(&app, "alice@example.com", "sunny day 42").await;

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/refresh",
            serde_json::json!({}),
            &[("refresh_token", &first.refresh)],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn mutating_requests_without_csrf_are_rejected() {
    let (app, _state) = spawn_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/signup",
            serde_json::json!({"email": "eve@example.com", "password": "cloudy day 42", "name": "Eve"}),
            &[],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "csrf_missing");

    // A token from one secret does not verify under another.
    let csrf_a = fetch_csrf(&app).await;
    let csrf_b = fetch_csrf(&app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/signup",
            serde_json::json!({"email": "eve@example.com", "password": "cloudy day 42", "name": "Eve"}),
            &[("csrf_secret", &csrf_b.cookie)],
            &[("x-csrf-token", &csrf_a.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "csrf_invalid");
}

async fn seed_session(state: &AppState, id: &str, owner: Option<&str>) {
    sqlx::query("INSERT INTO sessions (id, user_id) VALUES (?, ?)")
        .bind(id)
        .bind(owner)
        .execute(&state.db)
        .await
        .unwrap();
}

async fn seed_user(state: &AppState, id: &str) {
    sqlx::query(
        "INSERT INTO users (id, email, password_hash, name, email_verified) VALUES (?, ?, 'x', 'T', 1)",
    )
    .bind(id)
    .bind(format!("{id}@example.com"))
    .execute(&state.db)
    .await
    .unwrap();
}

fn access_cookie_for(state: &AppState, user_id: &str) -> String {
    state
        .tokens
        .issue(user_id, Role::User, keygate::auth::tokens::TokenPurpose::Access)
        .unwrap()
}

async fn get_session_as(app: &Router, session_id: &str, access: Option<&str>) -> StatusCode {
    let cookies: Vec<(&str, &str)> = match access {
        Some(token) => vec![("access_token", token)],
        None => vec![],
    };
    let response = app
        .clone()
        .oneshot(json_request(
            Method::GET,
            &format!("/api/sessions/{session_id}"),
            serde_json::json!({}),
            &cookies,
            &[],
        ))
        .await
        .unwrap();
    response.status()
}

#[tokio::test]
async fn ownership_matrix_is_enforced() {
    let (app, state) = spawn_app().await;

    seed_user(&state, "user-a").await;
    seed_user(&state, "user-b").await;
    seed_session(&state, "owned", Some("user-a")).await;
    seed_session(&state, "anon", None).await;

    let token_a = access_cookie_for(&state, "user-a");
    let token_b = access_cookie_for(&state, "user-b");

    // Owner reaches their session.
    assert_eq!(get_session_as(&app, "owned", Some(&token_a)).await, StatusCode::OK);
    // Another authenticated user is denied.
    assert_eq!(
        get_session_as(&app, "owned", Some(&token_b)).await,
        StatusCode::FORBIDDEN
    );
    // Anonymous reaches an unowned session only.
    assert_eq!(get_session_as(&app, "anon", None).await, StatusCode::OK);
    assert_eq!(get_session_as(&app, "owned", None).await, StatusCode::FORBIDDEN);
    // Absent resources are 404 for everyone, before ownership.
    assert_eq!(
        get_session_as(&app, "missing", Some(&token_a)).await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn recommendation_ownership_resolves_through_parent_session() {
    let (app, state) = spawn_app().await;

    seed_user(&state, "user-a").await;
    seed_user(&state, "user-b").await;
    seed_session(&state, "s1", Some("user-a")).await;
    sqlx::query("INSERT INTO recommendations (id, session_id) VALUES ('r1', 's1')")
        .execute(&state.db)
        .await
        .unwrap();

    let token_a = access_cookie_for(&state, "user-a");
    let token_b = access_cookie_for(&state, "user-b");

    let status = |token: String| {
        let app = app.clone();
        async move {
            app.oneshot(json_request(
                Method::GET,
                "/api/recommendations/r1",
                serde_json::json!({}),
                &[("access_token", &token)],
                &[],
            ))
            .await
            .unwrap()
            .status()
        }
    };

    assert_eq!(status(token_a).await, StatusCode::OK);
    assert_eq!(status(token_b).await, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn anonymous_session_creation_is_open_but_hijack_is_not() {
    let (app, state) = spawn_app().await;

    // Anonymous creation passes without any CSRF pair (pre-login flow).
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/sessions",
            serde_json::json!({}),
            &[],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert!(json["user_id"].is_null());

    // An authenticated creator owns the session.
    seed_user(&state, "user-a").await;
    let token_a = access_cookie_for(&state, "user-a");
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/sessions",
            serde_json::json!({}),
            &[("access_token", &token_a)],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["user_id"], "user-a");
}

#[tokio::test]
async fn expired_access_token_gets_its_own_error_code() {
    let (app, state) = spawn_app().await;
    seed_user(&state, "user-a").await;

    let expired = state
        .tokens
        .issue_with_ttl(
            "user-a",
            Role::User,
            keygate::auth::tokens::TokenPurpose::Access,
            -60,
        )
        .unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            Method::GET,
            "/api/auth/me",
            serde_json::json!({}),
            &[("access_token", &expired)],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "token_expired");

    // Garbage gets the generic invalid code instead.
    let response = app
        .clone()
        .oneshot(json_request(
            Method::GET,
            "/api/auth/me",
            serde_json::json!({}),
            &[("access_token", "garbage")],
            &[],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "invalid_token");
}

#[tokio::test]
async fn admin_routes_require_the_static_key() {
    let (app, _state) = spawn_app().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/cleanup/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/cleanup/status")
                .header("x-admin-key", "wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/cleanup/status")
                .header("x-admin-key", ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["schedulerEnabled"], false);
    assert_eq!(json["isRunning"], false);
}

#[tokio::test]
async fn forced_cleanup_runs_and_reports() {
    let (app, state) = spawn_app().await;

    seed_user(&state, "user-a").await;
    let past = (chrono::Utc::now() - chrono::Duration::days(1)).to_rfc3339();
    RefreshToken::create(&state.db, "user-a", "stale", &past)
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/admin/cleanup/run")
                .header("x-admin-key", ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["refreshTokensDeleted"], 1);

    // Second run finds nothing: the sweep is idempotent.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/admin/cleanup/run")
                .header("x-admin-key", ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["totalOperations"], 0);
}

#[tokio::test]
async fn login_rate_limit_blocks_brute_force_but_forgives_success() {
    let (app, state) = spawn_app().await;
    signup_and_verify(&app, &state, "alice@example.com").await;

    // Successful logins are forgiven and never drain the budget.
    for _ in 0..6 {
        login(&app, "alice@example.com", "sunny day 42").await;
    }

    // Five failures exhaust the login budget...
    for _ in 0..5 {
        let csrf = fetch_csrf(&app).await;
        let response = app
            .clone()
            .oneshot(json_request(
                Method::POST,
                "/api/auth/login",
                serde_json::json!({"email": "alice@example.com", "password": "wrong guess 1"}),
                &[("csrf_secret", &csrf.cookie)],
                &[("x-csrf-token", &csrf.token)],
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ...and the sixth attempt is throttled with a reset time.
    let csrf = fetch_csrf(&app).await;
    let response = app
        .clone()
        .oneshot(json_request(
            Method::POST,
            "/api/auth/login",
            serde_json::json!({"email": "alice@example.com", "password": "wrong guess 1"}),
            &[("csrf_secret", &csrf.cookie)],
            &[("x-csrf-token", &csrf.token)],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("Retry-After"));
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "rate_limited");
}
