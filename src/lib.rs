pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod engine;
pub mod notifications;
pub mod utils;

pub use db::DbPool;

use std::sync::Arc;

use crate::api::rate_limit::RateLimiter;
use crate::auth::tokens::TokenCodec;
use crate::config::{Config, Secrets};
use crate::engine::TokenCleanup;
use crate::notifications::Mailer;

pub struct AppState {
    pub config: Config,
    pub secrets: Secrets,
    pub tokens: TokenCodec,
    pub db: DbPool,
    pub rate_limiter: Arc<RateLimiter>,
    pub cleanup: Arc<TokenCleanup>,
    pub mailer: Arc<dyn Mailer>,
}

impl AppState {
    pub fn new(config: Config, secrets: Secrets, db: DbPool, mailer: Arc<dyn Mailer>) -> Self {
        let tokens = TokenCodec::new(&secrets);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let cleanup = Arc::new(TokenCleanup::new(
            db.clone(),
            &config.cleanup,
            config.auth.environment,
        ));
        Self {
            config,
            secrets,
            tokens,
            db,
            rate_limiter,
            cleanup,
            mailer,
        }
    }
}
