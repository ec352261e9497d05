use anyhow::Result;
use axum::{
    extract::State, http::StatusCode, middleware, response::Json, routing::get, Extension, Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiered_ratelimit::{
    config::load_layered_config,
    http::admission_middleware,
    metrics::Metrics,
    service::{AdmissionService, Decision},
    utils::{ceil_secs, SystemClock},
};

#[derive(Clone)]
struct AppState {
    service: Arc<AdmissionService>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tiered_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tiered admission control service");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let config = load_layered_config(config_path.as_deref())?;

    let metrics = Arc::new(Metrics::new()?);
    let service = Arc::new(AdmissionService::from_config(
        &config,
        Arc::new(SystemClock),
        metrics.clone(),
    )?);
    let sweeper = service.start_sweeper();

    let state = AppState {
        service: service.clone(),
        metrics,
    };

    let http_addr = std::env::var("HTTP_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        .parse::<SocketAddr>()?;

    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = start_http_server(state, http_addr) => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    sweeper.stop().await;
    info!("Service stopped");
    Ok(())
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let admitted = Router::new()
        .route("/api/admission/probe", get(probe))
        .layer(middleware::from_fn_with_state(
            state.service.clone(),
            admission_middleware,
        ));

    let app = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(admitted);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn probe(Extension(decision): Extension<Decision>) -> Json<serde_json::Value> {
    Json(json!({
        "allowed": decision.allowed,
        "tier": decision.tier,
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset_at": decision.reset_at,
        "retry_after_secs": ceil_secs(decision.retry_after),
    }))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let entries = state.service.registry().len();
    state.metrics.set_registry_entries(entries);

    Json(json!({
        "status": "healthy",
        "registry_entries": entries,
        "under_pressure": state.service.registry().is_under_pressure(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
