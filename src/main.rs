use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keygate::config::{Config, Secrets};
use keygate::notifications::LogMailer;
use keygate::AppState;

#[derive(Parser, Debug)]
#[command(name = "keygate")]
#[command(author, version, about = "Token-based authentication and authorization service", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "keygate.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        environment = config.auth.environment.as_str(),
        "Starting Keygate v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Validate signing material before serving any traffic. In production
    // a weak or missing secret aborts startup here.
    let secrets = Secrets::from_config(&config.auth)
        .context("Refusing to start with invalid auth secrets")?;

    // Ensure data directory exists
    keygate::utils::ensure_dir(&config.server.data_dir)?;

    // Initialize database
    let db = keygate::db::init(&config.server.data_dir).await?;

    // Create app state
    let state = Arc::new(AppState::new(
        config.clone(),
        secrets,
        db,
        Arc::new(LogMailer),
    ));

    // Background jobs: token cleanup sweep and rate limiter entry eviction
    keygate::engine::spawn_cleanup_task(state.cleanup.clone());
    keygate::api::rate_limit::spawn_sweep_task(
        state.rate_limiter.clone(),
        config.rate_limit.sweep_interval_seconds,
    );

    let mut app = keygate::api::create_router(state);

    // Credentialed CORS for the browser client, when configured
    if let Some(client_url) = &config.server.client_url {
        let origin: HeaderValue = client_url
            .parse()
            .with_context(|| format!("Invalid client_url: {client_url}"))?;
        app = app.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_credentials(true)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    header::HeaderName::from_static("x-csrf-token"),
                    header::HeaderName::from_static("x-admin-key"),
                ]),
        );
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
