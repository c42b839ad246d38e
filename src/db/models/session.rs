//! Ownership targets: analysis sessions and their recommendations.
//!
//! These rows belong to the CRUD layer; this service only reads them to
//! decide ownership. A session's `user_id` is nullable; anonymous sessions
//! support pre-login flows. A recommendation has no owner column of its own;
//! it is owned transitively through its parent session.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::DbPool;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Session {
    pub async fn find_by_id(pool: &DbPool, id: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn create(pool: &DbPool, user_id: Option<&str>) -> Result<Session, sqlx::Error> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions (id, user_id, created_at, updated_at)
             VALUES (?, ?, datetime('now'), datetime('now'))",
        )
        .bind(&id)
        .bind(user_id)
        .execute(pool)
        .await?;

        sqlx::query_as("SELECT * FROM sessions WHERE id = ?")
            .bind(&id)
            .fetch_one(pool)
            .await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Recommendation {
    pub id: String,
    pub session_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Recommendation {
    pub async fn find_by_id(
        pool: &DbPool,
        id: &str,
    ) -> Result<Option<Recommendation>, sqlx::Error> {
        sqlx::query_as("SELECT * FROM recommendations WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
