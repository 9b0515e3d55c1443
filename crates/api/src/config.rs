//! Server configuration loaded from the environment

use std::str::FromStr;

use watchdesk_billing::{BillingConfig, BillingError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
    #[error(transparent)]
    Billing(#[from] BillingError),
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub bind_address: String,
    /// Frontend origin allowed by CORS
    pub app_base_url: String,
    pub promo_signups_per_minute: u32,
    pub log_format: LogFormat,
    pub billing: BillingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let jwt_secret = std::env::var("JWT_SECRET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("JWT_SECRET"))?;

        Ok(Self {
            database_path: env_or("DATABASE_PATH", "watchdesk.db"),
            jwt_secret,
            jwt_expiry_hours: parse_env("JWT_EXPIRY_HOURS", 24)?,
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:3001"),
            app_base_url: env_or("APP_BASE_URL", "http://localhost:3000"),
            promo_signups_per_minute: parse_env("PROMO_SIGNUPS_PER_MINUTE", 5)?,
            log_format: parse_env("LOG_FORMAT", LogFormat::Text)?,
            billing: BillingConfig::from_env()?,
        })
    }

    /// Defaults suitable for tests; nothing is read from the environment.
    pub fn for_tests(jwt_secret: &str) -> Self {
        Self {
            database_path: ":memory:".to_string(),
            jwt_secret: jwt_secret.to_string(),
            jwt_expiry_hours: 24,
            bind_address: "127.0.0.1:0".to_string(),
            app_base_url: "http://localhost:3000".to_string(),
            promo_signups_per_minute: 5,
            log_format: LogFormat::Text,
            billing: BillingConfig::default(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        _ => Ok(default),
    }
}
