//! Refresh token ledger.
//!
//! Durable record of every issued long-lived token. The ledger, not the
//! signature, is the source of truth for whether a refresh token is still
//! live: rotation and login revocation work by deleting rows, so a
//! cryptographically valid token whose row is gone is dead.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::DbPool;

/// Refresh token lifetime: 7 days.
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: String,
    pub user_id: String,
    pub token: String,
    pub expires_at: String,
    pub created_at: String,
}

impl RefreshToken {
    /// Expiry timestamp for a token issued now.
    pub fn expiry_from_now() -> String {
        (Utc::now() + Duration::days(REFRESH_TOKEN_TTL_DAYS)).to_rfc3339()
    }

    /// Record a newly issued token.
    pub async fn create(
        pool: &DbPool,
        user_id: &str,
        token: &str,
        expires_at: &str,
    ) -> Result<RefreshToken, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token, expires_at, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(user_id)
        .bind(token)
        .bind(expires_at)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;

        sqlx::query_as("SELECT * FROM refresh_tokens WHERE id = ?")
            .bind(&id)
            .fetch_one(pool)
            .await
    }

    /// Look up a token by value, filtering out expired rows at query time.
    /// Expired-but-unswept rows must never resolve.
    pub async fn find_valid(
        pool: &DbPool,
        token: &str,
    ) -> Result<Option<RefreshToken>, sqlx::Error> {
        sqlx::query_as(
            "SELECT * FROM refresh_tokens
             WHERE token = ? AND datetime(expires_at) > datetime('now')",
        )
        .bind(token)
        .fetch_optional(pool)
        .await
    }

    /// Delete a single token row. Returns whether a row was actually
    /// removed; concurrent rotations race on this, and exactly one wins.
    pub async fn delete_by_token(pool: &DbPool, token: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token = ?")
            .bind(token)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke every token for a subject. Login and password reset call this
    /// to enforce a single active refresh line per account.
    pub async fn delete_all_for_user(pool: &DbPool, user_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?")
            .bind(user_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn seed_user(pool: &DbPool, id: &str) {
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, name) VALUES (?, ?, 'x', 'Test')",
        )
        .bind(id)
        .bind(format!("{id}@example.com"))
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn find_valid_filters_expired_rows() {
        let pool = db::init_in_memory().await.unwrap();
        seed_user(&pool, "u1").await;

        let past = (Utc::now() - Duration::days(1)).to_rfc3339();
        RefreshToken::create(&pool, "u1", "stale", &past).await.unwrap();
        let future = RefreshToken::expiry_from_now();
        RefreshToken::create(&pool, "u1", "live", &future).await.unwrap();

        assert!(RefreshToken::find_valid(&pool, "stale").await.unwrap().is_none());
        let found = RefreshToken::find_valid(&pool, "live").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
    }

    #[tokio::test]
    async fn delete_by_token_reports_whether_a_row_went_away() {
        let pool = db::init_in_memory().await.unwrap();
        seed_user(&pool, "u1").await;

        let expiry = RefreshToken::expiry_from_now();
        RefreshToken::create(&pool, "u1", "tok", &expiry).await.unwrap();

        assert!(RefreshToken::delete_by_token(&pool, "tok").await.unwrap());
        // Second delete races against nothing: the row is already gone.
        assert!(!RefreshToken::delete_by_token(&pool, "tok").await.unwrap());
    }

    #[tokio::test]
    async fn delete_all_for_user_revokes_every_line() {
        let pool = db::init_in_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_user(&pool, "u2").await;

        let expiry = RefreshToken::expiry_from_now();
        RefreshToken::create(&pool, "u1", "a", &expiry).await.unwrap();
        RefreshToken::create(&pool, "u1", "b", &expiry).await.unwrap();
        RefreshToken::create(&pool, "u2", "c", &expiry).await.unwrap();

        assert_eq!(RefreshToken::delete_all_for_user(&pool, "u1").await.unwrap(), 2);
        assert!(RefreshToken::find_valid(&pool, "a").await.unwrap().is_none());
        assert!(RefreshToken::find_valid(&pool, "c").await.unwrap().is_some());
    }
}
