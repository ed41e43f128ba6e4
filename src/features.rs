//! Lag, rolling-mean and calendar features over an hourly AQI series.

use std::collections::{HashSet, VecDeque};

use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::{Observation, HOUR_MS};

pub const DEFAULT_LAGS: [usize; 7] = [1, 3, 6, 12, 24, 48, 72];
pub const DEFAULT_WINDOWS: [usize; 4] = [3, 12, 24, 72];
pub const AQI_CLIP_MIN: f64 = 10.0;
pub const AQI_CLIP_MAX: f64 = 350.0;

pub const CALENDAR_COLUMNS: [&str; 4] = ["hour", "day", "month", "weekday"];

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub lags: Vec<usize>,
    pub windows: Vec<usize>,
    pub clip_min: f64,
    pub clip_max: f64,
    pub calendar_tz: Tz,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags: DEFAULT_LAGS.to_vec(),
            windows: DEFAULT_WINDOWS.to_vec(),
            clip_min: AQI_CLIP_MIN,
            clip_max: AQI_CLIP_MAX,
            calendar_tz: Tz::UTC,
        }
    }
}

impl FeatureConfig {
    /// Largest lag or window: how far back any derived feature reaches.
    pub fn history_span(&self) -> usize {
        self.lags
            .iter()
            .chain(self.windows.iter())
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Observations needed before the first fully defined feature row.
    pub fn warmup_len(&self) -> usize {
        self.history_span() + 1
    }

    pub fn clip(&self, aqi: f64) -> f64 {
        aqi.clamp(self.clip_min, self.clip_max)
    }

    pub fn validate(&self) -> Result<(), FeatureError> {
        if self.lags.is_empty() && self.windows.is_empty() {
            return Err(FeatureError::InvalidConfig(
                "at least one lag or window is required".to_string(),
            ));
        }
        if !(self.clip_min.is_finite() && self.clip_max.is_finite())
            || self.clip_min > self.clip_max
        {
            return Err(FeatureError::InvalidConfig(format!(
                "clip bounds must be finite with min <= max, got [{}, {}]",
                self.clip_min, self.clip_max
            )));
        }
        check_unique_positive("lags", &self.lags)?;
        check_unique_positive("windows", &self.windows)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarFields {
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    /// Monday = 0.
    pub weekday: u32,
}

impl CalendarFields {
    pub fn from_ts(ts_ms_utc: i64, tz: Tz) -> Result<Self, FeatureError> {
        let local = Utc
            .timestamp_millis_opt(ts_ms_utc)
            .single()
            .ok_or(FeatureError::InvalidTimestamp(ts_ms_utc))?
            .with_timezone(&tz);
        Ok(Self {
            hour: local.hour(),
            day: local.day(),
            month: local.month(),
            weekday: local.weekday().num_days_from_monday(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ts_ms_utc: i64,
    pub aqi_clean: f64,
    /// `(k, value)` pairs in configured lag order.
    pub lags: Vec<(usize, f64)>,
    /// `(r, mean)` pairs in configured window order.
    pub rolls: Vec<(usize, f64)>,
    pub calendar: CalendarFields,
}

impl FeatureRow {
    /// Looks up a derived feature by its schema column name.
    pub fn value(&self, column: &str) -> Option<f64> {
        if let Some(k) = column.strip_prefix("lag_") {
            let k: usize = k.parse().ok()?;
            return self.lags.iter().find(|(lag, _)| *lag == k).map(|(_, v)| *v);
        }
        if let Some(r) = column.strip_prefix("roll_") {
            let r: usize = r.parse().ok()?;
            return self.rolls.iter().find(|(w, _)| *w == r).map(|(_, v)| *v);
        }
        match column {
            "hour" => Some(self.calendar.hour as f64),
            "day" => Some(self.calendar.day as f64),
            "month" => Some(self.calendar.month as f64),
            "weekday" => Some(self.calendar.weekday as f64),
            "aqi_clean" => Some(self.aqi_clean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub fingerprint: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureBuildReport {
    pub input_points: u64,
    pub output_points: u64,
    pub warmup_points: u64,
    /// Consecutive observations more than one hour apart.
    pub gap_count: u64,
    pub clipped_points: u64,
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("invalid UTC timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error("observations out of order at {ts_ms_utc} (previous {previous_ts_ms_utc})")]
    UnsortedObservations {
        previous_ts_ms_utc: i64,
        ts_ms_utc: i64,
    },
}

/// Trailing buffer of cleaned values, newest at the back.
///
/// Holds at most `capacity` values so both the builder and the forecast loop
/// run in memory bounded by the configured history span.
#[derive(Debug, Clone)]
pub(crate) struct CleanHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl CleanHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    /// `n`-th value counting back from the newest (1 = newest).
    pub(crate) fn nth_back(&self, n: usize) -> Option<f64> {
        if n == 0 || n > self.values.len() {
            return None;
        }
        self.values.get(self.values.len() - n).copied()
    }

    /// Mean of the newest `n` values.
    pub(crate) fn mean_back(&self, n: usize) -> Option<f64> {
        if n == 0 || n > self.values.len() {
            return None;
        }
        let start = self.values.len() - n;
        let sum = self.values.range(start..).sum::<f64>();
        Some(sum / n as f64)
    }

    /// `(k, value)` for each lag, shifted `offset` past the newest value.
    /// `None` until every lag is covered.
    pub(crate) fn lags(&self, lags: &[usize], offset: usize) -> Option<Vec<(usize, f64)>> {
        lags.iter()
            .map(|k| self.nth_back(k + offset).map(|v| (*k, v)))
            .collect()
    }

    pub(crate) fn rolls(&self, windows: &[usize]) -> Option<Vec<(usize, f64)>> {
        windows
            .iter()
            .map(|r| self.mean_back(*r).map(|mean| (*r, mean)))
            .collect()
    }
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns = Vec::with_capacity(cfg.lags.len() + cfg.windows.len() + 4);
    for k in &cfg.lags {
        columns.push(format!("lag_{k}"));
    }
    for r in &cfg.windows {
        columns.push(format!("roll_{r}"));
    }
    for name in CALENDAR_COLUMNS {
        columns.push(name.to_string());
    }

    let fingerprint = schema_fingerprint(cfg, &columns);
    FeatureSchema {
        fingerprint,
        columns,
    }
}

/// Derives feature rows from observations sorted strictly ascending.
///
/// Rows whose lags or rolling means would reach before the first observation
/// are dropped, so fewer than `cfg.warmup_len()` observations yield an empty
/// result rather than an error. Lags are positional: a gap in the hourly
/// series is reported but does not realign the shift.
pub fn build_feature_rows(
    observations: &[Observation],
    cfg: &FeatureConfig,
) -> Result<(Vec<FeatureRow>, FeatureBuildReport), FeatureError> {
    cfg.validate()?;

    let warmup = cfg.warmup_len();
    let mut history = CleanHistory::new(warmup);
    let mut rows = Vec::with_capacity(observations.len().saturating_sub(warmup - 1));
    let mut report = FeatureBuildReport {
        input_points: observations.len() as u64,
        output_points: 0,
        warmup_points: 0,
        gap_count: 0,
        clipped_points: 0,
    };

    let mut previous_ts: Option<i64> = None;
    for observation in observations {
        if let Some(prev) = previous_ts {
            if observation.ts_ms_utc <= prev {
                return Err(FeatureError::UnsortedObservations {
                    previous_ts_ms_utc: prev,
                    ts_ms_utc: observation.ts_ms_utc,
                });
            }
            if observation.ts_ms_utc - prev != HOUR_MS {
                report.gap_count += 1;
            }
        }
        previous_ts = Some(observation.ts_ms_utc);

        let aqi_clean = cfg.clip(observation.aqi);
        if aqi_clean != observation.aqi {
            report.clipped_points += 1;
        }
        history.push(aqi_clean);

        // The newest value is this row, so lag k sits k + 1 back.
        let (Some(lags), Some(rolls)) = (history.lags(&cfg.lags, 1), history.rolls(&cfg.windows))
        else {
            report.warmup_points += 1;
            continue;
        };

        rows.push(FeatureRow {
            ts_ms_utc: observation.ts_ms_utc,
            aqi_clean,
            lags,
            rolls,
            calendar: CalendarFields::from_ts(observation.ts_ms_utc, cfg.calendar_tz)?,
        });
    }

    report.output_points = rows.len() as u64;

    if report.gap_count > 0 {
        warn!(
            component = "features",
            event = "features.build.gap_detected",
            gap_count = report.gap_count,
            input_points = report.input_points
        );
    }
    info!(
        component = "features",
        event = "features.build.finish",
        input_points = report.input_points,
        output_points = report.output_points,
        warmup_points = report.warmup_points,
        clipped_points = report.clipped_points
    );

    Ok((rows, report))
}

fn check_unique_positive(field: &str, values: &[usize]) -> Result<(), FeatureError> {
    let mut seen = HashSet::new();
    for value in values {
        if *value == 0 {
            return Err(FeatureError::InvalidConfig(format!(
                "{field} entries must be > 0"
            )));
        }
        if !seen.insert(*value) {
            return Err(FeatureError::InvalidConfig(format!(
                "{field} entries must be unique"
            )));
        }
    }
    Ok(())
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("clip:{}..{};", cfg.clip_min, cfg.clip_max));
    hasher.update(format!("tz:{};", cfg.calendar_tz.name()));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}
