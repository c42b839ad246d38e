//! Account flows and the authentication gates.
//!
//! Tokens travel as HTTP-only cookies with an `Authorization: Bearer`
//! fallback for non-browser clients. The refresh token ledger enforces a
//! single active refresh line per account: login revokes everything issued
//! before it, and every refresh rotates the presented token away.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
    Extension, Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::Duration as CookieDuration;
use tracing::{debug, info, warn};

use crate::api::error::{ApiError, ErrorCode};
use crate::auth::password::{hash_password, validate_password_strength, verify_password};
use crate::auth::tokens::{TokenPair, TokenPurpose, ACCESS_TOKEN_TTL_MINUTES};
use crate::config::Environment;
use crate::db::{LoginRequest, LoginResponse, RefreshToken, Role, SignupRequest, User, UserResponse};
use crate::utils::{mask_email, mask_user_id};
use crate::AppState;

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";

/// Header carrying the static operator key.
const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Verification tokens live for 24 hours.
const VERIFICATION_TOKEN_TTL_HOURS: i64 = 24;

/// Password reset tokens live for 1 hour.
const RESET_TOKEN_TTL_HOURS: i64 = 1;

/// Identity resolved for a request. Attached to request extensions by the
/// gates; handlers and downstream middleware read it explicitly.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub message: String,
    pub user: UserResponse,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub new_password: String,
}

/// Generate an opaque random token for email verification / password reset
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

fn hours_from_now(hours: i64) -> String {
    (chrono::Utc::now() + chrono::Duration::hours(hours)).to_rfc3339()
}

// -------------------------------------------------------------------------
// Cookie transport
// -------------------------------------------------------------------------

fn credential_cookie(
    name: &'static str,
    value: String,
    max_age: CookieDuration,
    environment: Environment,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .http_only(true)
        .secure(environment.is_production())
        .same_site(if environment.is_production() {
            SameSite::Strict
        } else {
            SameSite::Lax
        })
        .path("/")
        .max_age(max_age)
        .build()
}

/// Attach a freshly issued pair to the response jar.
pub fn set_token_cookies(jar: CookieJar, pair: &TokenPair, environment: Environment) -> CookieJar {
    jar.add(credential_cookie(
        ACCESS_TOKEN_COOKIE,
        pair.access_token.clone(),
        CookieDuration::minutes(ACCESS_TOKEN_TTL_MINUTES),
        environment,
    ))
    .add(credential_cookie(
        REFRESH_TOKEN_COOKIE,
        pair.refresh_token.clone(),
        CookieDuration::days(crate::auth::tokens::REFRESH_TOKEN_TTL_DAYS),
        environment,
    ))
}

/// Expire both credential cookies.
pub fn clear_token_cookies(jar: CookieJar) -> CookieJar {
    let expired = |name: &'static str| {
        Cookie::build((name, ""))
            .path("/")
            .max_age(CookieDuration::ZERO)
            .build()
    };
    jar.add(expired(ACCESS_TOKEN_COOKIE))
        .add(expired(REFRESH_TOKEN_COOKIE))
}

/// Read the access credential: cookie first, bearer header as fallback.
fn extract_access_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(ACCESS_TOKEN_COOKIE) {
        return Some(cookie.value().to_string());
    }
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Read the refresh credential: cookie first, bearer header as fallback.
fn extract_refresh_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(REFRESH_TOKEN_COOKIE) {
        return Some(cookie.value().to_string());
    }
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

fn decode_request_identity(
    state: &AppState,
    jar: &CookieJar,
    headers: &HeaderMap,
) -> Result<AuthUser, ApiError> {
    let token =
        extract_access_token(jar, headers).ok_or_else(ApiError::authentication_required)?;
    let claims = state.tokens.verify(&token, TokenPurpose::Access)?;
    Ok(AuthUser {
        user_id: claims.sub,
        role: claims.role,
    })
}

// -------------------------------------------------------------------------
// Gates
// -------------------------------------------------------------------------

/// Mandatory authentication. Rejects with `authentication_required` when no
/// credential is present; expired tokens get their own code so clients can
/// attempt a silent refresh.
pub async fn authenticate_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = decode_request_identity(&state, &jar, request.headers())?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Optional authentication. Resolution failures are logged and swallowed;
/// the request proceeds without an identity.
pub async fn optional_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match decode_request_identity(&state, &jar, request.headers()) {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
        }
        Err(err) => {
            debug!(code = err.code().as_str(), "Optional auth skipped");
        }
    }
    next.run(request).await
}

/// Static-key gate for operator-only routes. The key never identifies a
/// user; it only unlocks operational tooling.
pub async fn authenticate_admin(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(ApiError::authentication_required)?;

    let expected = state.secrets.admin_api_key.as_bytes();
    let provided = provided.as_bytes();

    // Only compare if lengths match (constant-time check)
    if expected.len() == provided.len() && bool::from(expected.ct_eq(provided)) {
        Ok(next.run(request).await)
    } else {
        warn!("Rejected admin request with invalid key");
        Err(ApiError::forbidden("Invalid admin key"))
    }
}

// -------------------------------------------------------------------------
// Account flow handlers
// -------------------------------------------------------------------------

/// POST /api/auth/signup
///
/// Creates an unverified account. No tokens are issued until the email is
/// verified; the client goes through login afterwards.
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SignupResponse>), ApiError> {
    if request.email.is_empty() || !request.email.contains('@') {
        return Err(ApiError::validation("email", "Invalid email address"));
    }
    if request.name.trim().is_empty() {
        return Err(ApiError::validation("name", "Name is required"));
    }
    if let Some(error) = validate_password_strength(&request.password) {
        return Err(ApiError::validation("password", error));
    }

    if User::find_by_email(&state.db, &request.email)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict("User with this email already exists"));
    }

    let password_hash = hash_password(&request.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {e}")))?;

    let id = uuid::Uuid::new_v4().to_string();
    let verification_token = generate_token();
    let verification_expires = hours_from_now(VERIFICATION_TOKEN_TTL_HOURS);
    let now = chrono::Utc::now().to_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, name, role, email_verified,
                           verification_token, verification_token_expires, created_at, updated_at)
        VALUES (?, ?, ?, ?, 'user', 0, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&request.email)
    .bind(&password_hash)
    .bind(request.name.trim())
    .bind(&verification_token)
    .bind(&verification_expires)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let user = User::find_by_id(&state.db, &id)
        .await?
        .ok_or_else(|| ApiError::internal("User vanished after insert"))?;

    if let Err(e) = state
        .mailer
        .send_verification_email(&user.email, &user.name, &verification_token)
        .await
    {
        // Registration still succeeds; the user can request a resend.
        warn!(user = %mask_user_id(&user.id), error = %e, "Failed to send verification email");
    }

    info!(user = %mask_user_id(&user.id), "User registered");

    Ok((
        StatusCode::CREATED,
        Json(SignupResponse {
            message: "Registration successful. Check your email to verify your account."
                .to_string(),
            user: UserResponse::from(user),
        }),
    ))
}

/// POST /api/auth/login
///
/// A successful login revokes every refresh token previously issued to the
/// account, then issues a fresh pair: one active device line per account.
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(request): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), ApiError> {
    // A missing account and a wrong password are indistinguishable to the
    // caller.
    fn invalid_credentials() -> ApiError {
        ApiError::new(ErrorCode::AuthenticationRequired, "Invalid credentials")
    }

    let user = User::find_by_email(&state.db, &request.email)
        .await?
        .ok_or_else(invalid_credentials)?;

    if !verify_password(&request.password, &user.password_hash) {
        return Err(invalid_credentials());
    }

    if !user.role().is_admin() && !user.is_verified() {
        return Err(ApiError::forbidden(
            "Email not verified. Check your inbox to verify your account.",
        ));
    }

    sqlx::query("UPDATE users SET last_login_at = ?, updated_at = ? WHERE id = ?")
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(&user.id)
        .execute(&state.db)
        .await?;

    // Invalidate any refresh line left over from a previous device or a
    // stolen-but-unused token.
    RefreshToken::delete_all_for_user(&state.db, &user.id).await?;

    let pair = state.tokens.issue_pair(&user.id, user.role())?;
    RefreshToken::create(
        &state.db,
        &user.id,
        &pair.refresh_token,
        &RefreshToken::expiry_from_now(),
    )
    .await?;

    info!(user = %mask_user_id(&user.id), "User logged in");

    let jar = set_token_cookies(jar, &pair, state.config.auth.environment);
    Ok((
        jar,
        Json(LoginResponse {
            user: UserResponse::from(user),
        }),
    ))
}

/// POST /api/auth/refresh
///
/// Rotation: the presented token must both verify cryptographically and
/// still exist in the ledger for the same subject. The old row is deleted
/// before the replacement is inserted; losing that delete race means another
/// rotation already consumed the token and this one fails.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<MessageResponse>), ApiError> {
    let presented = extract_refresh_token(&jar, &headers)
        .ok_or_else(ApiError::invalid_refresh_token)?;

    // Any verification failure on this path means "log in again"; an
    // expired refresh token is not refreshable.
    let claims = state
        .tokens
        .verify(&presented, TokenPurpose::Refresh)
        .map_err(|_| ApiError::invalid_refresh_token())?;

    let record = RefreshToken::find_valid(&state.db, &presented)
        .await?
        .ok_or_else(|| {
            warn!(user = %mask_user_id(&claims.sub), "Refresh attempt with revoked or rotated token");
            ApiError::invalid_refresh_token()
        })?;

    if record.user_id != claims.sub {
        warn!(
            user = %mask_user_id(&claims.sub),
            owner = %mask_user_id(&record.user_id),
            "Refresh token subject mismatch"
        );
        return Err(ApiError::invalid_refresh_token());
    }

    let user = User::find_by_id(&state.db, &record.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    let pair = state.tokens.issue_pair(&user.id, user.role())?;

    // The delete must consume the old row. Zero rows affected means a
    // concurrent rotation won; surface the loss instead of inserting a
    // second live token for this login line.
    if !RefreshToken::delete_by_token(&state.db, &presented).await? {
        warn!(user = %mask_user_id(&user.id), "Lost refresh rotation race");
        return Err(ApiError::invalid_refresh_token());
    }

    RefreshToken::create(
        &state.db,
        &user.id,
        &pair.refresh_token,
        &RefreshToken::expiry_from_now(),
    )
    .await?;

    let jar = set_token_cookies(jar, &pair, state.config.auth.environment);
    Ok((
        jar,
        Json(MessageResponse {
            message: "Token refreshed".to_string(),
        }),
    ))
}

/// POST /api/auth/logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<MessageResponse>), ApiError> {
    if let Some(presented) = extract_refresh_token(&jar, &headers) {
        RefreshToken::delete_by_token(&state.db, &presented).await?;
    }
    // Defensive: drop anything else still live for this subject.
    RefreshToken::delete_all_for_user(&state.db, &auth.user_id).await?;

    info!(user = %mask_user_id(&auth.user_id), "User logged out");

    let jar = clear_token_cookies(jar);
    Ok((
        jar,
        Json(MessageResponse {
            message: "Logged out".to_string(),
        }),
    ))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthUser>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = User::find_by_id(&state.db, &auth.user_id)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(UserResponse::from(user)))
}

/// POST /api/auth/verify-email
pub async fn verify_email(
    State(state): State<Arc<AppState>>,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = User::find_by_verification_token(&state.db, &request.token)
        .await?
        .ok_or_else(|| ApiError::bad_request("Invalid or expired verification token"))?;

    if !User::mark_verified(&state.db, &user.id).await? {
        return Err(ApiError::internal("Failed to verify email"));
    }

    info!(user = %mask_user_id(&user.id), "Email verified");

    Ok(Json(MessageResponse {
        message: "Email verified. You can now log in.".to_string(),
    }))
}

/// POST /api/auth/forgot-password
///
/// The response never reveals whether the account exists.
pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let reply = MessageResponse {
        message: "If an account exists with this email, you will receive a password reset link."
            .to_string(),
    };

    let Some(user) = User::find_by_email(&state.db, &request.email).await? else {
        return Ok(Json(reply));
    };

    let reset_token = generate_token();
    sqlx::query(
        "UPDATE users SET reset_password_token = ?, reset_password_expires = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&reset_token)
    .bind(hours_from_now(RESET_TOKEN_TTL_HOURS))
    .bind(chrono::Utc::now().to_rfc3339())
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    if let Err(e) = state
        .mailer
        .send_password_reset_email(&user.email, &user.name, &reset_token)
        .await
    {
        warn!(user = %mask_user_id(&user.id), error = %e, "Failed to send password reset email");
    }

    info!(
        user = %mask_user_id(&user.id),
        email = %mask_email(&user.email),
        "Password reset requested"
    );

    Ok(Json(reply))
}

/// POST /api/auth/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let user = User::find_by_reset_token(&state.db, &request.token)
        .await?
        .ok_or_else(|| ApiError::bad_request("Invalid or expired reset token"))?;

    if let Some(error) = validate_password_strength(&request.new_password) {
        return Err(ApiError::validation("new_password", error));
    }

    let password_hash = hash_password(&request.new_password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {e}")))?;

    if !User::apply_password_reset(&state.db, &user.id, &password_hash).await? {
        return Err(ApiError::internal("Failed to reset password"));
    }

    // A reset invalidates every outstanding refresh line.
    RefreshToken::delete_all_for_user(&state.db, &user.id).await?;

    info!(user = %mask_user_id(&user.id), "Password reset");

    Ok(Json(MessageResponse {
        message: "Password reset. You can now log in with your new password.".to_string(),
    }))
}
