//! Live AQI feed client.
//!
//! The upstream API answers `GET {url}?token={token}` with
//! `{"status":"ok","data":{"aqi":<number>,"time":{"iso":"<rfc3339>"}}}`.
//! Every failure mode has its own [`FeedError`] variant; callers decide
//! whether to degrade or surface.

use chrono::DateTime;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::cache::Observation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFeedConfig {
    pub url: String,
    /// Access token; the feed is disabled when absent.
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for LiveFeedConfig {
    fn default() -> Self {
        Self {
            url: "https://api.waqi.info/feed/here/".to_string(),
            token: None,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("live feed disabled: no access token configured")]
    Disabled,
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("unexpected HTTP status {status} from {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("feed reported status '{0}'")]
    ApiStatus(String),
    #[error("malformed feed payload: {0}")]
    Parse(String),
}

impl FeedError {
    /// Short machine-readable tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::HttpClientBuild(_) => "client_build",
            Self::Transport { .. } => "transport",
            Self::HttpStatus { .. } => "http_status",
            Self::ApiStatus(_) => "api_status",
            Self::Parse(_) => "parse",
        }
    }
}

/// Source of the most recent live observation.
pub trait FeedFetcher: Send + Sync {
    fn fetch_latest(&self) -> Result<Observation, FeedError>;
}

/// Stand-in used when no token is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledFeed;

impl FeedFetcher for DisabledFeed {
    fn fetch_latest(&self) -> Result<Observation, FeedError> {
        Err(FeedError::Disabled)
    }
}

/// Blocking HTTP client for the live feed. No retries: a failed call is
/// reported once and the caller moves on.
pub struct HttpFeedClient {
    client: reqwest::blocking::Client,
    url: String,
    token: String,
}

impl HttpFeedClient {
    pub fn new(cfg: &LiveFeedConfig) -> Result<Self, FeedError> {
        let token = cfg.token.clone().ok_or(FeedError::Disabled)?;
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|err| FeedError::HttpClientBuild(err.to_string()))?;
        Ok(Self {
            client,
            url: cfg.url.clone(),
            token,
        })
    }

    fn request_url(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{separator}token={}", self.url, self.token)
    }
}

impl FeedFetcher for HttpFeedClient {
    fn fetch_latest(&self) -> Result<Observation, FeedError> {
        let response = self
            .client
            .get(self.request_url())
            .send()
            .map_err(|err| FeedError::Transport {
                url: self.url.clone(),
                message: err.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().map_err(|err| FeedError::Transport {
            url: self.url.clone(),
            message: err.without_url().to_string(),
        })?;
        debug!(
            component = "feed",
            event = "feed.fetch.response",
            url = %self.url,
            bytes = bytes.len()
        );

        parse_feed_payload(&bytes)
    }
}

#[derive(Debug, Deserialize)]
struct FeedEnvelope {
    status: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FeedData {
    aqi: serde_json::Value,
    time: FeedTime,
}

#[derive(Debug, Deserialize)]
struct FeedTime {
    iso: String,
}

pub fn parse_feed_payload(payload: &[u8]) -> Result<Observation, FeedError> {
    let envelope: FeedEnvelope =
        serde_json::from_slice(payload).map_err(|err| FeedError::Parse(err.to_string()))?;
    if envelope.status != "ok" {
        return Err(FeedError::ApiStatus(envelope.status));
    }

    let data = envelope
        .data
        .ok_or_else(|| FeedError::Parse("missing data object".to_string()))?;
    let data: FeedData =
        serde_json::from_value(data).map_err(|err| FeedError::Parse(err.to_string()))?;

    let aqi = data
        .aqi
        .as_f64()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or_else(|| FeedError::Parse(format!("aqi is not a non-negative number: {}", data.aqi)))?;

    let ts = DateTime::parse_from_rfc3339(data.time.iso.trim())
        .map_err(|err| FeedError::Parse(format!("time.iso '{}': {err}", data.time.iso)))?;

    Ok(Observation::new(ts.timestamp_millis(), aqi))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_payload_yields_observation() {
        let payload = br#"{"status":"ok","data":{"aqi":87,"idx":1,"time":{"s":"x","iso":"2025-01-01T05:30:00+05:30"}}}"#;
        let obs = parse_feed_payload(payload).unwrap();
        assert_eq!(obs.aqi, 87.0);
        assert_eq!(obs.ts_ms_utc, 1_735_689_600_000);
    }

    #[test]
    fn non_ok_status_is_api_status_error() {
        let payload = br#"{"status":"error","data":"Invalid key"}"#;
        assert_eq!(
            parse_feed_payload(payload).unwrap_err(),
            FeedError::ApiStatus("error".to_string())
        );
    }

    #[test]
    fn placeholder_aqi_is_parse_error() {
        let payload = br#"{"status":"ok","data":{"aqi":"-","time":{"iso":"2025-01-01T00:00:00Z"}}}"#;
        let err = parse_feed_payload(payload).unwrap_err();
        assert_eq!(err.kind(), "parse");
    }

    #[test]
    fn bad_timestamp_and_garbage_are_parse_errors() {
        let payload = br#"{"status":"ok","data":{"aqi":12,"time":{"iso":"yesterday"}}}"#;
        assert!(matches!(
            parse_feed_payload(payload).unwrap_err(),
            FeedError::Parse(_)
        ));
        assert!(matches!(
            parse_feed_payload(b"<html>").unwrap_err(),
            FeedError::Parse(_)
        ));
    }

    #[test]
    fn client_requires_token() {
        let cfg = LiveFeedConfig::default();
        assert!(matches!(
            HttpFeedClient::new(&cfg),
            Err(FeedError::Disabled)
        ));
        assert_eq!(DisabledFeed.fetch_latest().unwrap_err(), FeedError::Disabled);
    }
}
