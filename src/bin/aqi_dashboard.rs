use std::sync::Arc;

use aqi_forecast::{
    dashboard_router, init_logging, log_app_bind, log_app_start, logging_config_from_env,
    shared_session, AppConfig, ForecastSession,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start(&logging_cfg);

    let cfg = AppConfig::from_env()?;

    // The blocking feed client must be built and dropped outside the async
    // runtime, so the session is owned here and only shared into the server.
    let session = shared_session(ForecastSession::from_config(&cfg)?);
    let app = dashboard_router(Arc::clone(&session));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
        log_app_bind(listener.local_addr()?);
        axum::serve(listener, app).await
    })?;

    drop(runtime);
    drop(session);
    Ok(())
}
