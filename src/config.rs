//! Environment-driven application configuration.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono_tz::Tz;
use thiserror::Error;

use crate::feed::LiveFeedConfig;
use crate::features::FeatureConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Feature rows required before a forecast is attempted.
    pub min_forecast_rows: usize,
    pub max_horizon_hours: usize,
    /// Rows of recent history shown alongside a forecast.
    pub history_display_rows: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            min_forecast_rows: 100,
            max_horizon_hours: 72,
            history_display_rows: 48,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub model_path: PathBuf,
    pub feature_columns_path: PathBuf,
    pub use_demo: bool,
    pub feed: LiveFeedConfig,
    pub features: FeatureConfig,
    pub session: SessionConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            model_path: PathBuf::from("aqi_model.json"),
            feature_columns_path: PathBuf::from("feature_columns.json"),
            use_demo: false,
            feed: LiveFeedConfig::default(),
            features: FeatureConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(raw) = non_empty_var("AQI_DASHBOARD_ADDR") {
            cfg.bind_addr = raw.parse().map_err(|err: std::net::AddrParseError| {
                invalid("AQI_DASHBOARD_ADDR", &raw, err.to_string())
            })?;
        }
        if let Some(raw) = non_empty_var("AQI_MODEL_PATH") {
            cfg.model_path = PathBuf::from(raw);
        }
        if let Some(raw) = non_empty_var("AQI_FEATURE_COLUMNS_PATH") {
            cfg.feature_columns_path = PathBuf::from(raw);
        }
        if let Some(raw) = non_empty_var("AQI_DASHBOARD_USE_DEMO") {
            cfg.use_demo = parse_bool(&raw)
                .ok_or_else(|| invalid("AQI_DASHBOARD_USE_DEMO", &raw, "expected a boolean"))?;
        }

        if let Some(raw) = non_empty_var("AQI_FEED_URL") {
            cfg.feed.url = raw;
        }
        cfg.feed.token = non_empty_var("AQI_FEED_TOKEN");
        if let Some(raw) = non_empty_var("AQI_FEED_TIMEOUT_MS") {
            cfg.feed.timeout_ms = parse_positive("AQI_FEED_TIMEOUT_MS", &raw)? as u64;
        }

        if let Some(raw) = non_empty_var("AQI_CALENDAR_TZ") {
            cfg.features.calendar_tz = raw
                .parse::<Tz>()
                .map_err(|err| invalid("AQI_CALENDAR_TZ", &raw, err.to_string()))?;
        }

        if let Some(raw) = non_empty_var("AQI_MAX_HORIZON_HOURS") {
            cfg.session.max_horizon_hours = parse_positive("AQI_MAX_HORIZON_HOURS", &raw)?;
        }
        if let Some(raw) = non_empty_var("AQI_MIN_FORECAST_ROWS") {
            cfg.session.min_forecast_rows = parse_positive("AQI_MIN_FORECAST_ROWS", &raw)?;
        }

        Ok(cfg)
    }
}

pub(crate) fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn parse_positive(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    match raw.parse::<usize>() {
        Ok(value) if value > 0 => Ok(value),
        Ok(_) => Err(invalid(var, raw, "must be > 0")),
        Err(err) => Err(invalid(var, raw, err.to_string())),
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
pub(crate) mod test_env {
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], f: impl FnOnce() -> R) -> R {
        let _guard = env_lock()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), env::var(key).ok()))
            .collect();

        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let output = f();

        for (key, value) in previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        output
    }
}
