use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Browser origin allowed to send credentialed requests. No CORS layer
    /// is mounted when unset.
    pub client_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            client_url: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Deployment environment. Controls secret validation strictness,
/// cookie attributes and the cleanup scheduler cadence.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_environment")]
    pub environment: Environment,
    /// Signing secret for access tokens. Required in production.
    pub access_secret: Option<String>,
    /// Signing secret for refresh tokens. Required in production, and must
    /// differ from the access secret so a leak of one domain cannot forge
    /// the other.
    pub refresh_secret: Option<String>,
    /// Static key for operator-only admin routes. Required in production.
    pub admin_api_key: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            access_secret: None,
            refresh_secret: None,
            admin_api_key: None,
        }
    }
}

fn default_environment() -> Environment {
    Environment::Development
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Login attempts per window. Successful logins are not counted.
    #[serde(default = "default_login_limit")]
    pub login_limit: u32,
    #[serde(default = "default_login_window")]
    pub login_window_seconds: u64,
    #[serde(default = "default_signup_limit")]
    pub signup_limit: u32,
    #[serde(default = "default_hour_window")]
    pub signup_window_seconds: u64,
    #[serde(default = "default_password_reset_limit")]
    pub password_reset_limit: u32,
    #[serde(default = "default_hour_window")]
    pub password_reset_window_seconds: u64,
    #[serde(default = "default_api_limit")]
    pub api_limit: u32,
    #[serde(default = "default_login_window")]
    pub api_window_seconds: u64,
    /// How often stale window entries are evicted from memory.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            login_limit: default_login_limit(),
            login_window_seconds: default_login_window(),
            signup_limit: default_signup_limit(),
            signup_window_seconds: default_hour_window(),
            password_reset_limit: default_password_reset_limit(),
            password_reset_window_seconds: default_hour_window(),
            api_limit: default_api_limit(),
            api_window_seconds: default_login_window(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_login_limit() -> u32 {
    5
}

fn default_login_window() -> u64 {
    15 * 60
}

fn default_signup_limit() -> u32 {
    3
}

fn default_hour_window() -> u64 {
    60 * 60
}

fn default_password_reset_limit() -> u32 {
    3
}

fn default_api_limit() -> u32 {
    100
}

fn default_sweep_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupConfig {
    /// Explicit override for the scheduler. When unset, the scheduler runs
    /// in production and stays off in development.
    pub enabled: Option<bool>,
    /// Override for the sweep interval. When unset: hourly in production,
    /// every 6 hours otherwise.
    pub interval_seconds: Option<u64>,
}

impl CleanupConfig {
    pub fn scheduler_enabled(&self, environment: Environment) -> bool {
        self.enabled.unwrap_or(environment.is_production())
    }

    pub fn interval(&self, environment: Environment) -> u64 {
        self.interval_seconds.unwrap_or(if environment.is_production() {
            60 * 60
        } else {
            6 * 60 * 60
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required in production")]
    MissingSecret { name: &'static str },
    #[error("{name} must be at least {min} characters long in production")]
    SecretTooShort { name: &'static str, min: usize },
    #[error("{name} contains a weak or placeholder value; use a cryptographically random string")]
    WeakSecret { name: &'static str },
    #[error("access and refresh secrets must differ")]
    SharedSecret,
}

/// Placeholder values that must never reach a production trust boundary.
const WEAK_SECRETS: &[&str] = &[
    "secret",
    "password",
    "change-me",
    "changeme",
    "your-secret",
    "jwt-secret",
    "dev-jwt-secret",
    "dev-refresh-secret",
    "not-for-production",
];

/// Validate a signing secret for the given environment.
///
/// Production: the secret must be present, at least `min_len` characters and
/// not contain a known placeholder. Development: a missing secret is replaced
/// by a deterministic fallback with a loud warning so the process stays
/// usable without configuration.
pub fn validate_secret(
    name: &'static str,
    value: Option<&str>,
    min_len: usize,
    environment: Environment,
) -> Result<String, ConfigError> {
    if environment.is_production() {
        let secret = value.ok_or(ConfigError::MissingSecret { name })?;
        if secret.len() < min_len {
            return Err(ConfigError::SecretTooShort { name, min: min_len });
        }
        let lower = secret.to_lowercase();
        if WEAK_SECRETS.iter().any(|weak| lower.contains(weak)) {
            return Err(ConfigError::WeakSecret { name });
        }
        Ok(secret.to_string())
    } else {
        match value {
            Some(secret) if !secret.is_empty() => Ok(secret.to_string()),
            _ => {
                warn!("using development fallback for {name}; never use in production");
                Ok(format!(
                    "dev-{}-fallback-not-for-production",
                    name.replace('_', "-")
                ))
            }
        }
    }
}

/// Fully validated signing material, produced once at startup.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub access: String,
    pub refresh: String,
    pub admin_api_key: String,
}

impl Secrets {
    pub fn from_config(auth: &AuthConfig) -> Result<Self, ConfigError> {
        let access = validate_secret(
            "access_secret",
            auth.access_secret.as_deref(),
            32,
            auth.environment,
        )?;
        let refresh = validate_secret(
            "refresh_secret",
            auth.refresh_secret.as_deref(),
            32,
            auth.environment,
        )?;
        if access == refresh {
            return Err(ConfigError::SharedSecret);
        }
        let admin_api_key = validate_secret(
            "admin_api_key",
            auth.admin_api_key.as_deref(),
            24,
            auth.environment,
        )?;
        Ok(Self {
            access,
            refresh,
            admin_api_key,
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cleanup: CleanupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
