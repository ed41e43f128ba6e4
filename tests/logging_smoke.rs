use std::io;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use aqi_forecast::{
    build_feature_schema, dashboard_router, log_app_bind, log_app_start, log_feed_selected,
    shared_session, DisabledFeed, FeatureColumns, FeatureConfig, ForecastSession,
    LoggingConfig, ModelArtifact, Observation, SessionConfig, HOUR_MS,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::util::ServiceExt;
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

const START_TS_MS: i64 = 1_735_689_600_000;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn demo_session(history_len: usize) -> ForecastSession {
    let features = FeatureConfig::default();
    let columns = FeatureColumns::from_schema(&build_feature_schema(&features))
        .expect("builder schema should be a valid column list");
    let model = ModelArtifact::persistence_blend(&columns);
    let mut session = ForecastSession::new(
        Box::new(model),
        columns,
        Box::new(DisabledFeed),
        features,
        SessionConfig::default(),
    );
    session.seed(
        (0..history_len).map(|i| Observation::new(START_TS_MS + i as i64 * HOUR_MS, 90.0)),
    );
    session
}

#[test]
fn refresh_logs_degraded_feed() {
    let logs = capture_logs(Level::INFO, || {
        let mut session = demo_session(5);
        session.refresh();
    });

    assert!(logs.contains("\"event\":\"feed.fetch.degraded\""));
    assert!(logs.contains("\"kind\":\"disabled\""));
}

#[test]
fn forecast_logs_feature_build_and_run_events() {
    let logs = capture_logs(Level::INFO, || {
        let session = demo_session(200);
        let out = session.forecast(3).expect("forecast should succeed");
        assert_eq!(out.points.len(), 3);
    });

    assert!(logs.contains("\"event\":\"features.build.finish\""));
    assert!(logs.contains("\"event\":\"forecast.run.finish\""));
    assert!(!logs.contains("\"event\":\"forecast.step\""));
}

#[test]
fn forecast_steps_are_logged_at_debug() {
    let logs = capture_logs(Level::DEBUG, || {
        let session = demo_session(200);
        session.forecast(2).expect("forecast should succeed");
    });

    assert_eq!(logs.matches("\"event\":\"forecast.step\"").count(), 2);
}

#[test]
fn short_history_logs_insufficient_history_warning() {
    let logs = capture_logs(Level::INFO, || {
        let session = demo_session(80);
        assert!(session.forecast(3).is_err());
    });

    assert!(logs.contains("\"event\":\"session.forecast.insufficient_history\""));
}

#[test]
fn server_lifecycle_helpers_emit_baseline_events() {
    let logs = capture_logs(Level::INFO, || {
        let cfg = LoggingConfig::default();
        log_app_start(&cfg);
        log_feed_selected("disabled", Some("AQI_FEED_TOKEN unset"));
        log_app_bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080));
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"event\":\"feed.selected\""));
    assert!(logs.contains("\"event\":\"app.bind\""));
    assert!(logs.contains("\"routes\":\"/,/predict,/api/history,/api/forecast,/api/predict\""));
}

#[test]
fn forecast_route_emits_http_forecast_event() {
    let logs = capture_logs(Level::INFO, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("single-thread runtime should build");

        rt.block_on(async {
            let app = dashboard_router(shared_session(demo_session(200)));

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/api/forecast?hours=4")
                        .body(Body::empty())
                        .expect("request should build"),
                )
                .await
                .expect("forecast request should succeed");

            assert_eq!(response.status(), StatusCode::OK);
        });
    });

    assert!(logs.contains("\"event\":\"http.forecast.request\""));
}
