//! Dashboard page and JSON routes over a shared forecasting session.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bucket::{AqiBucket, SingleShotPrediction};
use crate::cache::Observation;
use crate::forecast::{ForecastError, ForecastPoint};
use crate::session::{ForecastSession, RefreshOutcome};

pub type SharedSession = Arc<Mutex<ForecastSession>>;

/// Paths served by [`dashboard_router`].
pub const DASHBOARD_ROUTES: [&str; 5] = [
    "/",
    "/predict",
    "/api/history",
    "/api/forecast",
    "/api/predict",
];

const DEFAULT_HORIZON_HOURS: usize = 24;
const CHART_WIDTH: f64 = 860.0;
const CHART_HEIGHT: f64 = 220.0;

pub fn shared_session(session: ForecastSession) -> SharedSession {
    Arc::new(Mutex::new(session))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayPoint {
    pub ts_ms_utc: i64,
    pub time: String,
    pub aqi: String,
    pub bucket: String,
}

impl DisplayPoint {
    fn new(ts_ms_utc: i64, aqi: f64) -> Self {
        Self {
            ts_ms_utc,
            time: format_ts(ts_ms_utc),
            aqi: format!("{aqi:.2}"),
            bucket: AqiBucket::from_aqi(aqi).label().to_string(),
        }
    }
}

impl From<&Observation> for DisplayPoint {
    fn from(value: &Observation) -> Self {
        Self::new(value.ts_ms_utc, value.aqi)
    }
}

impl From<&ForecastPoint> for DisplayPoint {
    fn from(value: &ForecastPoint) -> Self {
        Self::new(value.ts_ms_utc, value.aqi_clean)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastView {
    pub hours: usize,
    pub refresh: RefreshOutcome,
    pub warning: Option<String>,
    /// Set when the model or feature builder failed; history is still shown.
    pub error: Option<String>,
    pub history: Vec<DisplayPoint>,
    pub forecast: Vec<DisplayPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionView {
    pub value: String,
    pub bucket: String,
    pub color: String,
}

impl From<SingleShotPrediction> for PredictionView {
    fn from(value: SingleShotPrediction) -> Self {
        Self {
            value: format!("{:.2}", value.value),
            bucket: value.bucket.label().to_string(),
            color: value.bucket.color().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ForecastQuery {
    pub hours: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub features: BTreeMap<String, f64>,
}

/// Everything the HTML page shows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardPage {
    pub feature_names: Vec<String>,
    pub inputs: BTreeMap<String, f64>,
    pub hours: usize,
    pub max_hours: usize,
    pub forecast: Option<ForecastView>,
    pub forecast_error: Option<String>,
    pub prediction: Option<PredictionView>,
    pub prediction_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ForecastError> for ApiError {
    fn from(err: ForecastError) -> Self {
        let status = match err {
            ForecastError::InvalidHorizon { .. } => StatusCode::BAD_REQUEST,
            ForecastError::InsufficientHistory { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ForecastError::Feature(_) | ForecastError::Model(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

pub fn dashboard_router(session: SharedSession) -> Router {
    Router::new()
        .route("/", get(get_dashboard_html))
        .route("/predict", post(post_predict_form))
        .route("/api/history", get(get_history))
        .route("/api/forecast", get(get_forecast))
        .route("/api/predict", post(post_predict_json))
        .with_state(DashboardAppState { session })
}

/// Refreshes from the feed, then forecasts `hours` ahead.
///
/// An out-of-range horizon is rejected before the feed is touched. Missing
/// history becomes a warning and a model or feature failure becomes an error
/// message on an otherwise complete view.
pub fn build_forecast_view(
    session: &mut ForecastSession,
    hours: usize,
) -> Result<ForecastView, ForecastError> {
    let max = session.config().max_horizon_hours;
    if hours == 0 || hours > max {
        return Err(ForecastError::InvalidHorizon {
            requested: hours,
            max,
        });
    }

    let refresh = session.refresh();
    let history: Vec<DisplayPoint> = session.history().iter().map(DisplayPoint::from).collect();
    let mut view = ForecastView {
        hours,
        refresh,
        warning: None,
        error: None,
        history,
        forecast: Vec::new(),
    };

    match session.forecast(hours) {
        Ok(out) => view.forecast = out.points.iter().map(DisplayPoint::from).collect(),
        Err(ForecastError::InsufficientHistory {
            required,
            available,
        }) => {
            view.warning = Some(format!(
                "Not enough history to forecast yet: {available} of {required} feature rows available."
            ));
        }
        Err(err @ (ForecastError::Feature(_) | ForecastError::Model(_))) => {
            warn!(
                component = "dashboard",
                event = "forecast.view.failed",
                hours,
                error = %err
            );
            view.error = Some(format!("Forecast failed: {err}"));
        }
        Err(err) => return Err(err),
    }
    Ok(view)
}

pub fn render_dashboard_html(page: &DashboardPage) -> String {
    let now_utc = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    let mut out = String::new();
    out.push_str("<!DOCTYPE html><html><head><meta charset=\"utf-8\">\n");
    out.push_str("<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n");
    out.push_str("<title>AQI Forecast</title>\n");
    out.push_str("<style>:root{--bg:#eef3f1;--card:#ffffff;--ink:#1b2426;--muted:#5d6a6d;--line:#d5dedc;--head:#1f3b3a;--btn:#2c6e63;--warn:#fff2c2;--err:#fde0dc}*{box-sizing:border-box}body{margin:0;color:var(--ink);font-family:\"Inter\",\"Segoe UI\",sans-serif;background:linear-gradient(160deg,var(--bg),#e3ecf3);min-height:100vh}.shell{max-width:1200px;margin:0 auto;padding:24px 18px;display:grid;grid-template-columns:280px 1fr;gap:16px}.hero{grid-column:1/-1;background:linear-gradient(135deg,#1f3b3a 0%,#2c6e63 100%);color:#f4faf9;border-radius:16px;padding:18px 20px}.hero h1{margin:0 0 6px;font-size:1.5rem}.hero-meta{display:flex;gap:16px;flex-wrap:wrap;font-size:.9rem;color:#d6ebe7}.card{background:var(--card);border:1px solid #c9d6d3;border-radius:14px;padding:14px 16px;box-shadow:0 8px 22px rgba(27,36,38,.08)}.card h2{margin:0 0 10px;font-size:1.05rem}label{display:block;font-size:.8rem;color:var(--muted);margin-top:8px}input,select{width:100%;padding:6px 8px;border:1px solid var(--line);border-radius:8px}button{margin-top:12px;width:100%;padding:8px;border:0;border-radius:9px;background:var(--btn);color:#fff;font-weight:700;cursor:pointer}table{width:100%;border-collapse:collapse}th{background:var(--head);color:#eef6f5;font-size:.75rem;text-transform:uppercase;letter-spacing:.04em;padding:7px 8px;text-align:left}td{font-size:.84rem;padding:6px 8px;border-bottom:1px solid var(--line)}.warning{background:var(--warn);border-radius:10px;padding:10px 12px}.error{background:var(--err);border-radius:10px;padding:10px 12px}.tables{display:grid;grid-template-columns:1fr 1fr;gap:16px}.bucket{font-weight:700}@media (max-width:860px){.shell{grid-template-columns:1fr}.tables{grid-template-columns:1fr}}</style>\n");
    out.push_str("</head><body><main class=\"shell\">\n");
    out.push_str("<section class=\"hero\"><h1>Air Quality Prediction (AQI)</h1>");
    out.push_str("<div class=\"hero-meta\">");
    out.push_str(&format!(
        "<span>Model features: {}</span>",
        page.feature_names.len()
    ));
    out.push_str(&format!(
        "<span>Generated: {}</span>",
        escape_html(&now_utc)
    ));
    out.push_str("</div></section>\n");

    render_predict_form(&mut out, page);

    out.push_str("<div class=\"main-col\">\n");
    render_horizon_form(&mut out, page);
    if let Some(error) = &page.forecast_error {
        out.push_str("<div class=\"error\">");
        out.push_str(&escape_html(error));
        out.push_str("</div>\n");
    }
    if let Some(view) = &page.forecast {
        render_forecast(&mut out, view);
    }
    out.push_str("</div>\n");

    out.push_str("</main></body></html>\n");
    out
}

fn render_predict_form(out: &mut String, page: &DashboardPage) {
    out.push_str("<section class=\"card\"><h2>Enter pollutant values</h2>");
    out.push_str("<form id=\"predict-form\" method=\"post\" action=\"/predict\">");
    for name in &page.feature_names {
        let value = page.inputs.get(name).copied().unwrap_or(0.0);
        let name = escape_html(name);
        out.push_str(&format!(
            "<label for=\"f-{name}\">{name}</label><input id=\"f-{name}\" type=\"number\" step=\"any\" name=\"{name}\" value=\"{value}\">"
        ));
    }
    out.push_str("<button type=\"submit\">Predict AQI</button></form>");

    if let Some(prediction) = &page.prediction {
        out.push_str(&format!(
            "<h3>Predicted AQI: {}</h3><h3 class=\"bucket\" style=\"color:{}\">AQI Bucket: {}</h3>",
            escape_html(&prediction.value),
            escape_html(&prediction.color),
            escape_html(&prediction.bucket)
        ));
    }
    if let Some(error) = &page.prediction_error {
        out.push_str("<div class=\"error\">");
        out.push_str(&escape_html(error));
        out.push_str("</div>");
    }
    out.push_str("</section>\n");
}

fn render_horizon_form(out: &mut String, page: &DashboardPage) {
    out.push_str("<section class=\"card\"><h2>Live forecast</h2>");
    out.push_str("<form id=\"horizon-form\" method=\"get\" action=\"/\">");
    out.push_str(&format!(
        "<label for=\"hours\">Forecast horizon (hours): {}</label>",
        page.hours
    ));
    out.push_str(&format!(
        "<input id=\"hours\" type=\"range\" name=\"hours\" min=\"1\" max=\"{}\" value=\"{}\" onchange=\"this.form.submit()\">",
        page.max_hours, page.hours
    ));
    out.push_str("</form></section>\n");
}

fn render_forecast(out: &mut String, view: &ForecastView) {
    if let RefreshOutcome::Degraded { reason, .. } = &view.refresh {
        out.push_str(&format!(
            "<p class=\"hero-meta\" style=\"color:#5d6a6d\">Live feed unavailable ({}); showing cached data.</p>",
            escape_html(reason)
        ));
    }
    if let Some(warning) = &view.warning {
        out.push_str("<div class=\"warning\">");
        out.push_str(&escape_html(warning));
        out.push_str("</div>\n");
    }
    if let Some(error) = &view.error {
        out.push_str("<div class=\"error\">");
        out.push_str(&escape_html(error));
        out.push_str("</div>\n");
    }

    out.push_str("<section class=\"card\"><h2>AQI trend</h2>");
    out.push_str(&render_chart_svg(&view.history, &view.forecast));
    out.push_str("</section>\n");

    out.push_str("<div class=\"tables\">");
    render_table(out, "Recent history", "history-table", &view.history);
    render_table(out, "Forecast", "forecast-table", &view.forecast);
    out.push_str("</div>\n");
}

fn render_table(out: &mut String, title: &str, id: &str, points: &[DisplayPoint]) {
    out.push_str(&format!(
        "<section class=\"card\"><h2>{}</h2><table id=\"{id}\"><thead><tr><th>Time</th><th>AQI</th><th>Bucket</th></tr></thead><tbody>",
        escape_html(title)
    ));
    for point in points {
        out.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape_html(&point.time),
            escape_html(&point.aqi),
            escape_html(&point.bucket)
        ));
    }
    out.push_str("</tbody></table></section>");
}

/// Inline SVG with the history line solid and the forecast line dashed.
pub fn render_chart_svg(history: &[DisplayPoint], forecast: &[DisplayPoint]) -> String {
    let values: Vec<f64> = history
        .iter()
        .chain(forecast.iter())
        .filter_map(|p| p.aqi.parse::<f64>().ok())
        .collect();

    let mut out = format!(
        "<svg id=\"aqi-chart\" viewBox=\"0 0 {CHART_WIDTH} {CHART_HEIGHT}\" width=\"100%\" role=\"img\">"
    );
    if values.len() < 2 {
        out.push_str("</svg>");
        return out;
    }

    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = if max > min { max - min } else { 1.0 };
    let step = CHART_WIDTH / (values.len() - 1) as f64;
    let coords: Vec<String> = values
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let x = i as f64 * step;
            let y = CHART_HEIGHT - (v - min) / span * (CHART_HEIGHT - 10.0) - 5.0;
            format!("{x:.1},{y:.1}")
        })
        .collect();

    let split = history.len().min(coords.len());
    if split >= 2 {
        out.push_str(&format!(
            "<polyline class=\"history\" fill=\"none\" stroke=\"#2c6e63\" stroke-width=\"2\" points=\"{}\"/>",
            coords[..split].join(" ")
        ));
    }
    if coords.len() > split {
        let start = split.saturating_sub(1);
        out.push_str(&format!(
            "<polyline class=\"forecast\" fill=\"none\" stroke=\"#c0562d\" stroke-width=\"2\" stroke-dasharray=\"6 4\" points=\"{}\"/>",
            coords[start..].join(" ")
        ));
    }
    out.push_str("</svg>");
    out
}

fn format_ts(ts_ms_utc: i64) -> String {
    Utc.timestamp_millis_opt(ts_ms_utc)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ts_ms_utc.to_string())
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[derive(Clone)]
struct DashboardAppState {
    session: SharedSession,
}

async fn with_session<T, F>(state: &DashboardAppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&mut ForecastSession) -> T + Send + 'static,
    T: Send + 'static,
{
    let session = Arc::clone(&state.session);
    tokio::task::spawn_blocking(move || {
        let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    })
    .await
    .map_err(|err| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

fn clamp_hours(requested: Option<usize>, max_hours: usize) -> usize {
    requested
        .unwrap_or(DEFAULT_HORIZON_HOURS)
        .clamp(1, max_hours.max(1))
}

async fn get_dashboard_html(
    State(state): State<DashboardAppState>,
    Query(query): Query<ForecastQuery>,
) -> Result<Html<String>, ApiError> {
    info!(
        component = "dashboard",
        event = "http.page.request",
        hours = ?query.hours
    );

    let page = with_session(&state, move |session| {
        let max_hours = session.config().max_horizon_hours;
        let hours = clamp_hours(query.hours, max_hours);
        let mut page = DashboardPage {
            feature_names: session.feature_columns().names().to_vec(),
            hours,
            max_hours,
            ..DashboardPage::default()
        };
        match build_forecast_view(session, hours) {
            Ok(view) => page.forecast = Some(view),
            Err(err) => page.forecast_error = Some(err.to_string()),
        }
        page
    })
    .await?;

    Ok(Html(render_dashboard_html(&page)))
}

async fn post_predict_form(
    State(state): State<DashboardAppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Html<String>, ApiError> {
    info!(
        component = "dashboard",
        event = "http.predict_form.request",
        fields = form.len()
    );

    let page = with_session(&state, move |session| {
        let max_hours = session.config().max_horizon_hours;
        let mut page = DashboardPage {
            feature_names: session.feature_columns().names().to_vec(),
            hours: clamp_hours(None, max_hours),
            max_hours,
            ..DashboardPage::default()
        };

        let mut bad_fields = Vec::new();
        for (name, raw) in &form {
            match raw.trim().parse::<f64>() {
                Ok(value) => {
                    page.inputs.insert(name.clone(), value);
                }
                Err(_) => bad_fields.push(name.clone()),
            }
        }
        bad_fields.sort();

        if !bad_fields.is_empty() {
            page.prediction_error = Some(format!("Not a number: {}", bad_fields.join(", ")));
        } else {
            match session.predict_single(&page.inputs) {
                Ok(prediction) => page.prediction = Some(prediction.into()),
                Err(err) => {
                    warn!(
                        component = "dashboard",
                        event = "http.predict_form.error",
                        error = %err
                    );
                    page.prediction_error = Some(err.to_string());
                }
            }
        }
        page
    })
    .await?;

    Ok(Html(render_dashboard_html(&page)))
}

async fn get_history(State(state): State<DashboardAppState>) -> Result<impl IntoResponse, ApiError> {
    info!(component = "dashboard", event = "http.history.request");

    let rows = with_session(&state, |session| {
        session
            .history()
            .iter()
            .map(DisplayPoint::from)
            .collect::<Vec<_>>()
    })
    .await?;

    Ok(Json(serde_json::json!({ "rows": rows })))
}

async fn get_forecast(
    State(state): State<DashboardAppState>,
    Query(query): Query<ForecastQuery>,
) -> Result<Json<ForecastView>, ApiError> {
    info!(
        component = "dashboard",
        event = "http.forecast.request",
        hours = ?query.hours
    );

    let result = with_session(&state, move |session| {
        let hours = query.hours.unwrap_or(DEFAULT_HORIZON_HOURS);
        build_forecast_view(session, hours)
    })
    .await?;

    match result {
        Ok(view) => Ok(Json(view)),
        Err(err) => {
            warn!(
                component = "dashboard",
                event = "http.forecast.error",
                error = %err
            );
            Err(err.into())
        }
    }
}

async fn post_predict_json(
    State(state): State<DashboardAppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictionView>, ApiError> {
    info!(
        component = "dashboard",
        event = "http.predict.request",
        fields = request.features.len()
    );

    let result = with_session(&state, move |session| {
        session.predict_single(&request.features)
    })
    .await?;

    result
        .map(|prediction| Json(prediction.into()))
        .map_err(|err| ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, aqi: f64) -> DisplayPoint {
        DisplayPoint::new(ts, aqi)
    }

    #[test]
    fn display_point_formats_time_value_and_bucket() {
        let p = point(1_735_689_600_000, 123.456);
        assert_eq!(p.time, "2025-01-01 00:00 UTC");
        assert_eq!(p.aqi, "123.46");
        assert_eq!(p.bucket, "Moderate");
    }

    #[test]
    fn chart_splits_history_and_forecast_lines() {
        let history = vec![point(0, 10.0), point(1, 20.0), point(2, 30.0)];
        let forecast = vec![point(3, 40.0), point(4, 50.0)];
        let svg = render_chart_svg(&history, &forecast);

        assert!(svg.contains("class=\"history\""));
        assert!(svg.contains("class=\"forecast\""));
        assert!(svg.ends_with("</svg>"));
    }

    #[test]
    fn chart_with_too_few_points_is_empty_svg() {
        let svg = render_chart_svg(&[point(0, 10.0)], &[]);
        assert!(!svg.contains("polyline"));
    }

    #[test]
    fn page_escapes_feature_names_and_shows_bucket_color() {
        let page = DashboardPage {
            feature_names: vec!["pm2.5<x>".to_string()],
            hours: 6,
            max_hours: 72,
            prediction: Some(PredictionView {
                value: "42.00".to_string(),
                bucket: "Good".to_string(),
                color: "green".to_string(),
            }),
            ..DashboardPage::default()
        };
        let html = render_dashboard_html(&page);

        assert!(html.contains("pm2.5&lt;x&gt;"));
        assert!(!html.contains("pm2.5<x>"));
        assert!(html.contains("style=\"color:green\""));
        assert!(html.contains("AQI Bucket: Good"));
        assert!(html.contains("max=\"72\""));
    }

    #[test]
    fn hours_are_clamped_into_range() {
        assert_eq!(clamp_hours(None, 72), 24);
        assert_eq!(clamp_hours(Some(0), 72), 1);
        assert_eq!(clamp_hours(Some(500), 72), 72);
        assert_eq!(clamp_hours(None, 12), 12);
    }

    #[test]
    fn forecast_errors_map_to_client_or_server_status() {
        let err: ApiError = ForecastError::InsufficientHistory {
            required: 100,
            available: 3,
        }
        .into();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);

        let err: ApiError = ForecastError::InvalidHorizon {
            requested: 0,
            max: 72,
        }
        .into();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err: ApiError = ForecastError::Model(crate::model::ModelError::NonFinitePrediction(
            f64::NAN,
        ))
        .into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
