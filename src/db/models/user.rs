//! User model and account queries.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::DbPool;

/// Flat role taxonomy. Roles are consumed, never computed: the token codec
/// embeds them in claims and the gates compare them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    ContentManager,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
            Role::ContentManager => "content_manager",
        }
    }

    /// Unknown values in stored rows fall back to the least-privileged role.
    pub fn parse(value: &str) -> Role {
        match value {
            "admin" => Role::Admin,
            "content_manager" => Role::ContentManager,
            _ => Role::User,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::ContentManager)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: String,
    pub email_verified: i64,
    #[serde(skip_serializing)]
    pub verification_token: Option<String>,
    pub verification_token_expires: Option<String>,
    #[serde(skip_serializing)]
    pub reset_password_token: Option<String>,
    pub reset_password_expires: Option<String>,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn role(&self) -> Role {
        Role::parse(&self.role)
    }

    pub fn is_verified(&self) -> bool {
        self.email_verified != 0
    }

    pub async fn find_by_id(pool: &DbPool, id: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Email lookup is case-insensitive (the column collates NOCASE).
    pub async fn find_by_email(pool: &DbPool, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(pool)
            .await
    }

    /// Look up an unverified user by a still-live verification token.
    pub async fn find_by_verification_token(
        pool: &DbPool,
        token: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM users
            WHERE verification_token = ?
              AND email_verified = 0
              AND (verification_token_expires IS NULL
                   OR datetime(verification_token_expires) > datetime('now'))
            "#,
        )
        .bind(token)
        .fetch_optional(pool)
        .await
    }

    /// Look up a user by a still-live password reset token.
    pub async fn find_by_reset_token(
        pool: &DbPool,
        token: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT * FROM users
            WHERE reset_password_token = ?
              AND reset_password_expires IS NOT NULL
              AND datetime(reset_password_expires) > datetime('now')
            "#,
        )
        .bind(token)
        .fetch_optional(pool)
        .await
    }

    /// Mark the email verified and clear the verification token.
    pub async fn mark_verified(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET email_verified = 1,
                verification_token = NULL,
                verification_token_expires = NULL,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replace the password hash and clear the reset token.
    pub async fn apply_password_reset(
        pool: &DbPool,
        id: &str,
        password_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET password_hash = ?,
                reset_password_token = NULL,
                reset_password_expires = NULL,
                updated_at = datetime('now')
            WHERE id = ?
            "#,
        )
        .bind(password_hash)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Client-facing view of a user. Never carries the password hash or any
/// raw credential token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: String,
    pub email_verified: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            role: user.role,
            email_verified: user.email_verified != 0,
            last_login_at: user.last_login_at,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user: UserResponse,
}
