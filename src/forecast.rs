//! Recursive one-step-ahead forecasting.
//!
//! Each prediction is appended to the cleaned history and feeds the lag and
//! rolling features of the following hour. Errors compound with the horizon;
//! no bias correction or interval is produced.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::HOUR_MS;
use crate::features::{CalendarFields, CleanHistory, FeatureConfig, FeatureError, FeatureRow};
use crate::model::{predict_one, FeatureColumns, ModelError, RegressionModel};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub ts_ms_utc: i64,
    pub aqi_clean: f64,
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast horizon must be between 1 and {max} hours, got {requested}")]
    InvalidHorizon { requested: usize, max: usize },
    #[error("insufficient history: {available} feature rows available, {required} required")]
    InsufficientHistory { required: usize, available: usize },
    #[error("feature error: {0}")]
    Feature(#[from] FeatureError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

/// Minimum feature rows the loop needs before any lag or window lookup can
/// reach outside the working sequence.
pub fn required_history(cfg: &FeatureConfig) -> usize {
    cfg.warmup_len()
}

/// Projects `horizon` consecutive hours past the last input row.
///
/// The input must be the output of
/// [`build_feature_rows`](crate::build_feature_rows) under the same `cfg`.
/// Only the newest `history_span + 1` cleaned values are retained while
/// iterating, so memory stays flat for any horizon.
pub fn forecast_recursive(
    rows: &[FeatureRow],
    horizon: usize,
    model: &dyn RegressionModel,
    columns: &FeatureColumns,
    cfg: &FeatureConfig,
) -> Result<Vec<ForecastPoint>, ForecastError> {
    cfg.validate()?;
    if horizon == 0 {
        return Err(ForecastError::InvalidHorizon {
            requested: horizon,
            max: usize::MAX,
        });
    }

    let required = required_history(cfg);
    let Some(last) = rows.last() else {
        return Err(ForecastError::InsufficientHistory {
            required,
            available: 0,
        });
    };
    if rows.len() < required {
        return Err(ForecastError::InsufficientHistory {
            required,
            available: rows.len(),
        });
    }

    let mut history = CleanHistory::new(required);
    for row in &rows[rows.len() - required..] {
        history.push(row.aqi_clean);
    }

    let mut latest = last.clone();
    let mut out = Vec::with_capacity(horizon);

    for step in 1..=horizon {
        let prediction = predict_one(model, columns.vector_for_row(&latest)?)?;
        let ts_ms_utc = latest.ts_ms_utc + HOUR_MS;

        // Lags and windows are read before the prediction joins the history.
        let short = || ForecastError::InsufficientHistory {
            required,
            available: history.len(),
        };
        let lags = history.lags(&cfg.lags, 0).ok_or_else(short)?;
        let rolls = history.rolls(&cfg.windows).ok_or_else(short)?;

        latest = FeatureRow {
            ts_ms_utc,
            aqi_clean: prediction,
            lags,
            rolls,
            calendar: CalendarFields::from_ts(ts_ms_utc, cfg.calendar_tz)?,
        };
        history.push(prediction);

        debug!(
            component = "forecast",
            event = "forecast.step",
            step,
            ts_ms_utc,
            prediction
        );
        out.push(ForecastPoint {
            ts_ms_utc,
            aqi_clean: prediction,
        });
    }

    info!(
        component = "forecast",
        event = "forecast.run.finish",
        horizon,
        input_rows = rows.len(),
        first_ts_ms_utc = out.first().map(|p| p.ts_ms_utc).unwrap_or_default(),
        last_prediction = out.last().map(|p| p.aqi_clean).unwrap_or_default()
    );

    Ok(out)
}
