//! Token cleanup scheduler.
//!
//! A recurring sweep that removes stale credential state from the store:
//! expired refresh tokens are deleted, expired verification and password
//! reset tokens are nulled out. The sweep runs hourly in production and
//! every six hours otherwise, shares the store with live request handlers
//! (all its mutations are condition-scoped, so a row a handler already
//! consumed simply counts as zero here), and keeps a bounded history of
//! runs for health reporting.

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

use crate::config::{CleanupConfig, Environment};
use crate::DbPool;

/// Bounded run history: the last 24 runs.
const MAX_HISTORY_ENTRIES: usize = 24;

/// Delay before the first scheduled run, letting the process settle.
const STARTUP_DELAY_SECS: u64 = 60;

/// Statistics from a single cleanup run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStats {
    pub timestamp: DateTime<Utc>,
    pub refresh_tokens_deleted: u64,
    pub verification_tokens_expired: u64,
    pub password_reset_tokens_expired: u64,
    pub total_operations: u64,
    pub execution_time_ms: u64,
}

/// Service status for operational tooling
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupStatus {
    pub is_running: bool,
    pub scheduler_enabled: bool,
    pub last_cleanup: Option<DateTime<Utc>>,
    pub history_entries: usize,
    pub environment: String,
}

/// Health view: how stale is the last successful run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupHealth {
    pub healthy: bool,
    pub hours_since_last_run: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issue: Option<String>,
}

/// Handles periodic credential-state cleanup
pub struct TokenCleanup {
    db: DbPool,
    environment: Environment,
    scheduler_enabled: bool,
    interval_seconds: u64,
    running: AtomicBool,
    history: Mutex<VecDeque<CleanupStats>>,
}

impl TokenCleanup {
    pub fn new(db: DbPool, config: &CleanupConfig, environment: Environment) -> Self {
        Self {
            db,
            environment,
            scheduler_enabled: config.scheduler_enabled(environment),
            interval_seconds: config.interval(environment),
            running: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(MAX_HISTORY_ENTRIES)),
        }
    }

    pub fn scheduler_enabled(&self) -> bool {
        self.scheduler_enabled
    }

    pub fn interval_seconds(&self) -> u64 {
        self.interval_seconds
    }

    /// Run one cleanup pass. Returns `None` when another run is already in
    /// progress; the trigger is skipped, never queued. Both the scheduled
    /// and the manual/forced path go through this guard.
    pub async fn run(&self) -> Result<Option<CleanupStats>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Token cleanup already in progress, skipping");
            return Ok(None);
        }

        let started = Instant::now();
        let result = self.execute_sweeps().await;
        self.running.store(false, Ordering::SeqCst);

        match result {
            Ok((refresh, verification, reset)) => {
                let stats = CleanupStats {
                    timestamp: Utc::now(),
                    refresh_tokens_deleted: refresh,
                    verification_tokens_expired: verification,
                    password_reset_tokens_expired: reset,
                    total_operations: refresh + verification + reset,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                };
                self.add_to_history(stats.clone());

                if stats.total_operations > 0 {
                    info!(
                        refresh_tokens = stats.refresh_tokens_deleted,
                        verification_tokens = stats.verification_tokens_expired,
                        reset_tokens = stats.password_reset_tokens_expired,
                        duration_ms = stats.execution_time_ms,
                        "Token cleanup completed"
                    );
                } else {
                    info!("Token cleanup completed - no expired tokens found");
                }

                Ok(Some(stats))
            }
            Err(e) => {
                // The run is retried on the next scheduled tick, never
                // immediately.
                error!(error = %e, "Token cleanup failed");
                Err(e)
            }
        }
    }

    /// The three sweeps, one pass. Any error aborts the run.
    async fn execute_sweeps(&self) -> Result<(u64, u64, u64)> {
        let refresh = sqlx::query(
            "DELETE FROM refresh_tokens WHERE datetime(expires_at) < datetime('now')",
        )
        .execute(&self.db)
        .await?
        .rows_affected();

        let verification = sqlx::query(
            r#"
            UPDATE users
            SET verification_token = NULL, verification_token_expires = NULL
            WHERE verification_token IS NOT NULL
              AND datetime(verification_token_expires) < datetime('now')
            "#,
        )
        .execute(&self.db)
        .await?
        .rows_affected();

        let reset = sqlx::query(
            r#"
            UPDATE users
            SET reset_password_token = NULL, reset_password_expires = NULL
            WHERE reset_password_token IS NOT NULL
              AND datetime(reset_password_expires) < datetime('now')
            "#,
        )
        .execute(&self.db)
        .await?
        .rows_affected();

        Ok((refresh, verification, reset))
    }

    fn add_to_history(&self, stats: CleanupStats) {
        let mut history = self.history.lock();
        if history.len() == MAX_HISTORY_ENTRIES {
            history.pop_front();
        }
        history.push_back(stats);
    }

    pub fn history(&self) -> Vec<CleanupStats> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn last_run(&self) -> Option<CleanupStats> {
        self.history.lock().back().cloned()
    }

    pub fn status(&self) -> CleanupStatus {
        CleanupStatus {
            is_running: self.running.load(Ordering::SeqCst),
            scheduler_enabled: self.scheduler_enabled,
            last_cleanup: self.last_run().map(|s| s.timestamp),
            history_entries: self.history.lock().len(),
            environment: self.environment.as_str().to_string(),
        }
    }

    /// Health check for monitoring systems. A run is considered stale after
    /// 25 hours in production (one missed hourly run plus slack) and 150
    /// hours otherwise.
    pub fn health(&self) -> CleanupHealth {
        let max_hours = if self.environment.is_production() {
            25.0
        } else {
            150.0
        };

        match self.last_run() {
            Some(stats) => {
                let hours = (Utc::now() - stats.timestamp).num_seconds() as f64 / 3600.0;
                if hours > max_hours {
                    CleanupHealth {
                        healthy: false,
                        hours_since_last_run: Some(hours),
                        issue: Some(format!("No cleanup in {} hours", hours.round())),
                    }
                } else {
                    CleanupHealth {
                        healthy: true,
                        hours_since_last_run: Some(hours),
                        issue: None,
                    }
                }
            }
            None => {
                if self.scheduler_enabled {
                    CleanupHealth {
                        healthy: false,
                        hours_since_last_run: None,
                        issue: Some("No cleanup has completed yet".to_string()),
                    }
                } else {
                    CleanupHealth {
                        healthy: true,
                        hours_since_last_run: None,
                        issue: None,
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn force_running(&self, value: bool) {
        self.running.store(value, Ordering::SeqCst);
    }
}

/// Spawn the background cleanup task
pub fn spawn_cleanup_task(cleanup: Arc<TokenCleanup>) {
    if !cleanup.scheduler_enabled() {
        info!("Token cleanup scheduler is disabled");
        return;
    }

    let interval_secs = cleanup.interval_seconds();
    info!(
        interval_secs = interval_secs,
        "Starting token cleanup scheduler"
    );

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(STARTUP_DELAY_SECS)).await;

        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = cleanup.run().await {
                error!(error = %e, "Scheduled token cleanup failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn cleanup_for(pool: DbPool) -> TokenCleanup {
        TokenCleanup::new(
            pool,
            &CleanupConfig {
                enabled: Some(true),
                interval_seconds: Some(60),
            },
            Environment::Development,
        )
    }

    async fn seed_expired_state(pool: &DbPool) {
        let past = (Utc::now() - chrono::Duration::days(1)).to_rfc3339();
        let future = (Utc::now() + chrono::Duration::days(1)).to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, name,
                               verification_token, verification_token_expires,
                               reset_password_token, reset_password_expires)
            VALUES ('u1', 'stale@example.com', 'x', 'Stale', 'vt', ?, 'rt', ?)
            "#,
        )
        .bind(&past)
        .bind(&past)
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, name,
                               verification_token, verification_token_expires)
            VALUES ('u2', 'fresh@example.com', 'x', 'Fresh', 'vt2', ?)
            "#,
        )
        .bind(&future)
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token, expires_at) VALUES ('r1', 'u1', 'dead', ?)",
        )
        .bind(&past)
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO refresh_tokens (id, user_id, token, expires_at) VALUES ('r2', 'u2', 'live', ?)",
        )
        .bind(&future)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn sweeps_only_expired_state() {
        let pool = db::init_in_memory().await.unwrap();
        seed_expired_state(&pool).await;
        let cleanup = cleanup_for(pool.clone()).await;

        let stats = cleanup.run().await.unwrap().unwrap();
        assert_eq!(stats.refresh_tokens_deleted, 1);
        assert_eq!(stats.verification_tokens_expired, 1);
        assert_eq!(stats.password_reset_tokens_expired, 1);
        assert_eq!(stats.total_operations, 3);

        // The live rows survive.
        let live: Option<(String,)> =
            sqlx::query_as("SELECT token FROM refresh_tokens WHERE token = 'live'")
                .fetch_optional(&pool)
                .await
                .unwrap();
        assert!(live.is_some());
        let fresh: (Option<String>,) =
            sqlx::query_as("SELECT verification_token FROM users WHERE id = 'u2'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(fresh.0.is_some());
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let pool = db::init_in_memory().await.unwrap();
        seed_expired_state(&pool).await;
        let cleanup = cleanup_for(pool).await;

        let first = cleanup.run().await.unwrap().unwrap();
        assert!(first.total_operations > 0);

        let second = cleanup.run().await.unwrap().unwrap();
        assert_eq!(second.total_operations, 0);
    }

    #[tokio::test]
    async fn overlapping_run_is_skipped_not_queued() {
        let pool = db::init_in_memory().await.unwrap();
        let cleanup = cleanup_for(pool).await;

        cleanup.force_running(true);
        assert!(cleanup.run().await.unwrap().is_none());

        cleanup.force_running(false);
        assert!(cleanup.run().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let pool = db::init_in_memory().await.unwrap();
        let cleanup = cleanup_for(pool).await;

        for _ in 0..30 {
            cleanup.run().await.unwrap();
        }
        assert_eq!(cleanup.history().len(), MAX_HISTORY_ENTRIES);
        assert_eq!(cleanup.status().history_entries, MAX_HISTORY_ENTRIES);
    }

    #[tokio::test]
    async fn health_reflects_run_recency() {
        let pool = db::init_in_memory().await.unwrap();
        let cleanup = cleanup_for(pool).await;

        // Scheduler enabled but nothing has run yet.
        let health = cleanup.health();
        assert!(!health.healthy);

        cleanup.run().await.unwrap();
        let health = cleanup.health();
        assert!(health.healthy);
        assert!(health.hours_since_last_run.unwrap() < 1.0);
    }
}
