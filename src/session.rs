//! One interactive forecasting session: the observation cache plus the model
//! and feed it is evaluated against.
//!
//! The session is the single writer of its cache. Every forecast rebuilds
//! features from the cached observations; nothing derived is persisted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::bucket::{predict_single, SingleShotPrediction};
use crate::cache::{LiveDataCache, MergeReport, Observation, HOUR_MS};
use crate::config::{AppConfig, SessionConfig};
use crate::features::{build_feature_rows, build_feature_schema, FeatureConfig};
use crate::feed::{DisabledFeed, FeedError, FeedFetcher, HttpFeedClient};
use crate::forecast::{forecast_recursive, required_history, ForecastError, ForecastPoint};
use crate::model::{FeatureColumns, ModelArtifact, ModelError, RegressionModel};
use crate::observability::log_feed_selected;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Merged { inserted: usize, total: usize },
    Degraded { reason: String, total: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionForecast {
    pub horizon: usize,
    pub feature_rows: usize,
    pub points: Vec<ForecastPoint>,
}

#[derive(Debug, Error)]
pub enum SessionInitError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("feature config error: {0}")]
    Feature(#[from] crate::features::FeatureError),
}

pub struct ForecastSession {
    cache: LiveDataCache,
    model: Box<dyn RegressionModel>,
    columns: FeatureColumns,
    feed: Box<dyn FeedFetcher>,
    features: FeatureConfig,
    cfg: SessionConfig,
}

impl ForecastSession {
    pub fn new(
        model: Box<dyn RegressionModel>,
        columns: FeatureColumns,
        feed: Box<dyn FeedFetcher>,
        features: FeatureConfig,
        cfg: SessionConfig,
    ) -> Self {
        Self {
            cache: LiveDataCache::new(),
            model,
            columns,
            feed,
            features,
            cfg,
        }
    }

    /// Loads artifacts and wires the feed described by `app`.
    ///
    /// Demo mode skips artifact loading: it uses the builder's own schema with
    /// [`ModelArtifact::persistence_blend`] and seeds synthetic history.
    pub fn from_config(app: &AppConfig) -> Result<Self, SessionInitError> {
        app.features.validate()?;
        let schema = build_feature_schema(&app.features);

        let (model, columns): (Box<dyn RegressionModel>, FeatureColumns) = if app.use_demo {
            let columns = FeatureColumns::from_schema(&schema)?;
            let model = ModelArtifact::persistence_blend(&columns);
            (Box::new(model), columns)
        } else {
            let columns = FeatureColumns::load(&app.feature_columns_path)?;
            let model = ModelArtifact::load(&app.model_path)?;
            model.ensure_matches(&columns)?;
            (Box::new(model), columns)
        };

        let feed: Box<dyn FeedFetcher> = match app.feed.token {
            Some(_) => {
                log_feed_selected("http", None);
                Box::new(HttpFeedClient::new(&app.feed)?)
            }
            None => {
                log_feed_selected("disabled", Some("AQI_FEED_TOKEN unset"));
                Box::new(DisabledFeed)
            }
        };

        if let Err(err) = columns.ensure_derivable(&schema) {
            // Single-shot prediction still works on pollutant inputs.
            warn!(
                component = "session",
                event = "session.forecast.unavailable",
                error = %err
            );
        }

        let mut session = Self::new(
            model,
            columns,
            feed,
            app.features.clone(),
            app.session.clone(),
        );
        if app.use_demo {
            let len = app.session.min_forecast_rows + app.features.history_span() + 24;
            let now_ms = chrono::Utc::now().timestamp_millis();
            session.seed(demo_history(now_ms, len));
        }
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.cfg
    }

    pub fn feature_columns(&self) -> &FeatureColumns {
        &self.columns
    }

    pub fn seed<I>(&mut self, observations: I) -> MergeReport
    where
        I: IntoIterator<Item = Observation>,
    {
        self.cache.merge(observations)
    }

    /// Pulls the latest live reading into the cache.
    ///
    /// Feed failures never propagate: they are logged and the session keeps
    /// working from what is already cached.
    pub fn refresh(&mut self) -> RefreshOutcome {
        match self.feed.fetch_latest() {
            Ok(observation) => {
                let report = self.cache.merge([observation]);
                info!(
                    component = "session",
                    event = "session.refresh.merged",
                    ts_ms_utc = observation.ts_ms_utc,
                    aqi = observation.aqi,
                    inserted = report.inserted,
                    total = report.total
                );
                RefreshOutcome::Merged {
                    inserted: report.inserted,
                    total: report.total,
                }
            }
            Err(err) => {
                warn!(
                    component = "session",
                    event = "feed.fetch.degraded",
                    kind = err.kind(),
                    error = %err,
                    cached = self.cache.len()
                );
                RefreshOutcome::Degraded {
                    reason: err.kind().to_string(),
                    total: self.cache.len(),
                }
            }
        }
    }

    pub fn history(&self) -> Vec<Observation> {
        self.cache.recent(self.cfg.history_display_rows)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn forecast(&self, horizon: usize) -> Result<SessionForecast, ForecastError> {
        if horizon == 0 || horizon > self.cfg.max_horizon_hours {
            return Err(ForecastError::InvalidHorizon {
                requested: horizon,
                max: self.cfg.max_horizon_hours,
            });
        }

        let (rows, _) = build_feature_rows(&self.cache.observations(), &self.features)?;
        let required = self.cfg.min_forecast_rows.max(required_history(&self.features));
        if rows.len() < required {
            warn!(
                component = "session",
                event = "session.forecast.insufficient_history",
                feature_rows = rows.len(),
                required,
                cached = self.cache.len()
            );
            return Err(ForecastError::InsufficientHistory {
                required,
                available: rows.len(),
            });
        }

        let points = forecast_recursive(
            &rows,
            horizon,
            self.model.as_ref(),
            &self.columns,
            &self.features,
        )?;

        Ok(SessionForecast {
            horizon,
            feature_rows: rows.len(),
            points,
        })
    }

    pub fn predict_single(
        &self,
        inputs: &BTreeMap<String, f64>,
    ) -> Result<SingleShotPrediction, ModelError> {
        predict_single(self.model.as_ref(), &self.columns, inputs)
    }
}

/// Hourly synthetic series ending at the hour before `now_ms`, with a daily
/// cycle between roughly 50 and 170.
pub fn demo_history(now_ms: i64, len: usize) -> Vec<Observation> {
    let end = now_ms.div_euclid(HOUR_MS) * HOUR_MS;
    let start = end - len as i64 * HOUR_MS;
    (0..len)
        .map(|i| {
            let ts = start + i as i64 * HOUR_MS;
            let phase = (i % 24) as f64 / 24.0 * std::f64::consts::TAU;
            Observation::new(ts, 110.0 + 60.0 * phase.sin())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LinearModel;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    const T0: i64 = 1_735_689_600_000;

    struct ScriptedFeed {
        responses: Mutex<Vec<Result<Observation, FeedError>>>,
    }

    impl FeedFetcher for ScriptedFeed {
        fn fetch_latest(&self) -> Result<Observation, FeedError> {
            self.responses
                .lock()
                .expect("feed lock should not be poisoned")
                .pop()
                .unwrap_or(Err(FeedError::Disabled))
        }
    }

    fn session_with(feed: Vec<Result<Observation, FeedError>>) -> ForecastSession {
        let features = FeatureConfig::default();
        let columns = FeatureColumns::from_schema(&build_feature_schema(&features)).unwrap();
        let model = ModelArtifact::persistence_blend(&columns);
        ForecastSession::new(
            Box::new(model),
            columns,
            Box::new(ScriptedFeed {
                responses: Mutex::new(feed),
            }),
            features,
            SessionConfig::default(),
        )
    }

    fn constant(len: usize, value: f64) -> Vec<Observation> {
        (0..len)
            .map(|i| Observation::new(T0 + i as i64 * HOUR_MS, value))
            .collect()
    }

    #[test]
    fn refresh_merges_and_degrades_without_error() {
        let mut session = session_with(vec![
            Err(FeedError::HttpStatus {
                url: "u".to_string(),
                status: 502,
            }),
            Ok(Observation::new(T0, 40.0)),
        ]);

        assert_eq!(
            session.refresh(),
            RefreshOutcome::Merged {
                inserted: 1,
                total: 1
            }
        );
        assert_eq!(
            session.refresh(),
            RefreshOutcome::Degraded {
                reason: "http_status".to_string(),
                total: 1
            }
        );
        assert_eq!(session.cached_len(), 1);
    }

    #[test]
    fn forecast_requires_caller_threshold_of_feature_rows() {
        let mut session = session_with(Vec::new());
        session.seed(constant(150, 60.0));

        // 150 observations give 78 feature rows, below the default 100.
        assert!(matches!(
            session.forecast(6).unwrap_err(),
            ForecastError::InsufficientHistory {
                required: 100,
                available: 78
            }
        ));

        session.seed((150..172).map(|i| Observation::new(T0 + i * HOUR_MS, 60.0)));
        let out = session.forecast(6).unwrap();
        assert_eq!(out.feature_rows, 100);
        assert_eq!(out.points.len(), 6);
        assert!(out.points.iter().all(|p| (p.aqi_clean - 60.0).abs() < 1e-9));
    }

    #[test]
    fn horizon_is_bounded_by_config() {
        let mut session = session_with(Vec::new());
        session.seed(constant(200, 60.0));

        assert!(matches!(
            session.forecast(0).unwrap_err(),
            ForecastError::InvalidHorizon { requested: 0, max: 72 }
        ));
        assert!(matches!(
            session.forecast(73).unwrap_err(),
            ForecastError::InvalidHorizon { requested: 73, .. }
        ));
        assert_eq!(session.forecast(72).unwrap().points.len(), 72);
    }

    #[test]
    fn single_shot_uses_session_model() {
        let columns = FeatureColumns::new(vec!["pm25".to_string()]).unwrap();
        let session = ForecastSession::new(
            Box::new(ModelArtifact::Linear(LinearModel {
                intercept: 1.0,
                coefficients: vec![2.0],
            })),
            columns,
            Box::new(DisabledFeed),
            FeatureConfig::default(),
            SessionConfig::default(),
        );

        let inputs = BTreeMap::from([("pm25".to_string(), 25.0)]);
        let out = session.predict_single(&inputs).unwrap();
        assert_eq!(out.value, 51.0);
        assert_eq!(out.bucket.label(), "Satisfactory");
    }

    fn json_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{contents}").unwrap();
        file
    }

    #[test]
    fn demo_config_seeds_enough_history_to_forecast() {
        let app = AppConfig {
            use_demo: true,
            ..AppConfig::default()
        };
        let mut session = ForecastSession::from_config(&app).unwrap();

        assert_eq!(
            session.cached_len(),
            app.session.min_forecast_rows + app.features.history_span() + 24
        );
        assert!(matches!(
            session.refresh(),
            RefreshOutcome::Degraded { ref reason, .. } if reason == "disabled"
        ));

        let out = session.forecast(24).unwrap();
        assert_eq!(out.points.len(), 24);
        assert!(out.feature_rows >= app.session.min_forecast_rows);
    }

    #[test]
    fn artifacts_with_mismatched_feature_counts_are_rejected() {
        let columns = json_file(r#"["lag_1","roll_3"]"#);
        let model = json_file(r#"{"kind":"linear","intercept":0.0,"coefficients":[1.0,2.0,3.0]}"#);
        let app = AppConfig {
            model_path: model.path().to_path_buf(),
            feature_columns_path: columns.path().to_path_buf(),
            ..AppConfig::default()
        };

        let Err(err) = ForecastSession::from_config(&app) else {
            panic!("mismatched artifacts should not build a session");
        };
        assert!(matches!(
            err,
            SessionInitError::Model(ModelError::FeatureCountMismatch {
                found: 2,
                expected: 3
            })
        ));
    }

    #[test]
    fn missing_model_file_is_io_error() {
        let columns = json_file(r#"["lag_1","roll_3"]"#);
        let app = AppConfig {
            model_path: PathBuf::from("/definitely/not/here/aqi_model.json"),
            feature_columns_path: columns.path().to_path_buf(),
            ..AppConfig::default()
        };

        let Err(err) = ForecastSession::from_config(&app) else {
            panic!("missing model should not build a session");
        };
        assert!(matches!(err, SessionInitError::Model(ModelError::Io { .. })));
    }

    #[test]
    fn matching_artifacts_build_a_forecasting_session() {
        let columns = json_file(r#"["lag_1","roll_3"]"#);
        let model = json_file(r#"{"kind":"linear","intercept":0.0,"coefficients":[0.0,1.0]}"#);
        let app = AppConfig {
            model_path: model.path().to_path_buf(),
            feature_columns_path: columns.path().to_path_buf(),
            ..AppConfig::default()
        };

        let mut session = ForecastSession::from_config(&app).unwrap();
        assert_eq!(session.cached_len(), 0);
        session.seed(constant(172, 80.0));
        let out = session.forecast(3).unwrap();
        assert!(out.points.iter().all(|p| (p.aqi_clean - 80.0).abs() < 1e-9));
    }

    #[test]
    fn demo_history_is_hourly_and_ends_before_now() {
        let now = T0 + 30 * 60 * 1_000;
        let history = demo_history(now, 10);
        assert_eq!(history.len(), 10);
        assert_eq!(history.last().unwrap().ts_ms_utc, T0 - HOUR_MS);
        for pair in history.windows(2) {
            assert_eq!(pair[1].ts_ms_utc - pair[0].ts_ms_utc, HOUR_MS);
        }
    }
}
