//! AQI forecasting core crate.
//!
//! Implemented scope:
//! - session-scoped live observation cache, deduplicated by timestamp
//! - lag / rolling-mean / calendar feature builder
//! - recursive one-step-ahead forecast loop over a bounded history window
//! - JSON regression model artifacts and AQI bucket mapping
//! - live feed client and an axum dashboard

mod bucket;
mod cache;
mod config;
mod dashboard;
mod features;
mod feed;
mod forecast;
mod model;
mod observability;
mod session;

pub use bucket::{predict_single, AqiBucket, SingleShotPrediction};
pub use cache::{LiveDataCache, MergeReport, Observation, HOUR_MS};
pub use config::{AppConfig, ConfigError, SessionConfig};
pub use dashboard::{
    build_forecast_view, dashboard_router, render_chart_svg, render_dashboard_html,
    shared_session, ApiError, DashboardPage, DisplayPoint, ForecastQuery, ForecastView,
    PredictRequest, PredictionView, SharedSession, DASHBOARD_ROUTES,
};
pub use features::{
    build_feature_rows, build_feature_schema, CalendarFields, FeatureBuildReport, FeatureConfig,
    FeatureError, FeatureRow, FeatureSchema, AQI_CLIP_MAX, AQI_CLIP_MIN, CALENDAR_COLUMNS,
    DEFAULT_LAGS, DEFAULT_WINDOWS,
};
pub use feed::{
    parse_feed_payload, DisabledFeed, FeedError, FeedFetcher, HttpFeedClient, LiveFeedConfig,
};
pub use forecast::{forecast_recursive, required_history, ForecastError, ForecastPoint};
pub use model::{
    predict_one, FeatureColumns, LinearModel, ModelArtifact, ModelError, RegressionModel,
    RegressionTree, TreeEnsemble, TreeNode,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_feed_selected, logging_config_from_env,
    LogFormat, LoggingConfig, LoggingInitError,
};
pub use session::{
    demo_history, ForecastSession, RefreshOutcome, SessionForecast, SessionInitError,
};
