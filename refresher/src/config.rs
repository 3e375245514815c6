use anyhow::anyhow;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{env, path::PathBuf, time::Duration};

pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

const DEFAULT_LOGIN_BASE_URL: &str = "https://kite.zerodha.com/connect/login";
const DEFAULT_API_BASE_URL: &str = "https://api.kite.trade";

/// Runtime settings sourced from the environment (and `.env` when present).
///
/// Broker secrets are not part of this struct; they are read by
/// [`CredentialProvider`](crate::services::credentials::CredentialProvider)
/// exactly once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub owner_key: String,
    pub updated_by: String,
    pub user_key: String,
    pub settings_path: Option<PathBuf>,
    pub login_base_url: String,
    pub api_base_url: String,
    pub http_timeout_seconds: u64,
    pub db_connect_timeout_seconds: u64,
    pub element_timeout_seconds: u64,
    pub redirect_timeout_seconds: u64,
    pub max_attempts: u32,
    pub retry_delay_seconds: u64,
    pub headless: bool,
    pub time_zone: Tz,
    pub dry_run: bool,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let flag = |name: &str| {
            var(name)
                .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        let number = |name: &str, default: u64| {
            var(name)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let database_url = var(DATABASE_URL_VAR);

        let owner_key = var("TOKEN_OWNER_KEY").unwrap_or_else(|| "kite-access-token".to_string());
        let updated_by =
            var("TOKEN_UPDATED_BY").unwrap_or_else(|| "kite-token-refresher".to_string());
        let user_key = var("KITE_USER_KEY").unwrap_or_else(|| "XW7136".to_string());
        let settings_path = var("APP_SETTINGS_PATH").map(PathBuf::from);

        let login_base_url =
            var("KITE_LOGIN_BASE_URL").unwrap_or_else(|| DEFAULT_LOGIN_BASE_URL.to_string());
        let api_base_url =
            var("KITE_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let max_attempts = var("LOGIN_MAX_ATTEMPTS")
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(3);

        let time_zone_name = var("APP_TIMEZONE").unwrap_or_else(|| "Asia/Kolkata".to_string());
        let time_zone: Tz = time_zone_name
            .parse()
            .map_err(|_| anyhow!("Invalid APP_TIMEZONE value: {}", time_zone_name))?;

        Ok(Config {
            database_url,
            owner_key,
            updated_by,
            user_key,
            settings_path,
            login_base_url,
            api_base_url,
            http_timeout_seconds: number("HTTP_TIMEOUT_SECONDS", 30),
            db_connect_timeout_seconds: number("DB_CONNECT_TIMEOUT_SECONDS", 10),
            element_timeout_seconds: number("LOGIN_ELEMENT_TIMEOUT_SECONDS", 20),
            redirect_timeout_seconds: number("LOGIN_REDIRECT_TIMEOUT_SECONDS", 20),
            max_attempts,
            retry_delay_seconds: number("LOGIN_RETRY_DELAY_SECONDS", 5),
            headless: flag("HEADLESS") || flag("GITHUB_ACTIONS"),
            time_zone,
            dry_run: flag("DRY_RUN"),
        })
    }

    /// Required names this config could not resolve. A dry run never touches the store.
    pub fn missing_required(&self) -> Vec<&'static str> {
        if self.database_url.is_none() && !self.dry_run {
            vec![DATABASE_URL_VAR]
        } else {
            Vec::new()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.db_connect_timeout_seconds)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}
