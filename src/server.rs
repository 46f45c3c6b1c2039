//! Dashboard HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use toolguard_core::{BreakerPhase, HealthStatus};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::monitor::Monitor;
use crate::{Error, Result};

/// Create the router
pub fn create_router(monitor: Arc<Monitor>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/dashboard", get(dashboard_handler))
        .route("/tools/{id}/reset", post(reset_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(monitor)
}

/// GET /health: 503 while any tool is CRITICAL or has an open breaker
async fn health_handler(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    let dashboard = monitor.dashboard_snapshot();
    let failing: Vec<&String> = dashboard
        .iter()
        .filter(|(_, row)| {
            row.status == HealthStatus::Critical || row.breaker_phase == BreakerPhase::Open
        })
        .map(|(id, _)| id)
        .collect();
    let unavailable: Vec<&String> = dashboard
        .iter()
        .filter(|(_, row)| row.status == HealthStatus::Unavailable)
        .map(|(id, _)| id)
        .collect();

    let healthy = failing.is_empty();
    let body = json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "tools": dashboard.len(),
        "failing": failing,
        "unavailable": unavailable,
    });

    if healthy {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// GET /dashboard
async fn dashboard_handler(State(monitor): State<Arc<Monitor>>) -> impl IntoResponse {
    Json(json!({
        "tools": monitor.dashboard_snapshot(),
        "alerts": monitor.alerts().stats(),
        "cache": monitor.cache().stats(),
    }))
}

/// POST /tools/{id}/reset
async fn reset_handler(
    State(monitor): State<Arc<Monitor>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match monitor.reset_tool(&id) {
        Ok(()) => (StatusCode::OK, Json(json!({ "reset": id }))),
        Err(Error::UnknownTool(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown tool: {id}") })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Serve the dashboard until `shutdown` fires
pub async fn serve(
    config: &ServerConfig,
    monitor: Arc<Monitor>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::new(
        config
            .host
            .parse()
            .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
        config.port,
    );
    let listener = TcpListener::bind(addr).await?;
    info!(host = %config.host, port = config.port, "Dashboard listening");

    let router = create_router(monitor);
    #[cfg(feature = "metrics")]
    let router = if config.metrics {
        router.merge(metrics_router()?)
    } else {
        router
    };

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

/// Install the process-wide Prometheus recorder and expose it at `GET /metrics`
#[cfg(feature = "metrics")]
pub fn metrics_router() -> Result<Router> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("metrics recorder: {e}")))?;
    info!("Prometheus metrics enabled at /metrics");
    Ok(Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    ))
}

/// Wait for Ctrl+C or SIGTERM, then broadcast shutdown
pub async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    if shutdown_tx.send(()).is_err() {
        warn!("No tasks were listening for shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::failsafe::Admission;
    use crate::monitor::MonitorBuilder;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::DateTime;
    use serde_json::Value;
    use std::time::Duration;
    use toolguard_core::Outcome;
    use tower::ServiceExt;

    fn monitor() -> Arc<Monitor> {
        let config = Config::from_yaml("tools:\n  - id: roster\n  - id: acgme\n").unwrap();
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap()));
        Arc::new(
            MonitorBuilder::new(config)
                .clock(clock)
                .alert_sinks(Vec::new())
                .build()
                .unwrap(),
        )
    }

    fn trip(monitor: &Monitor, tool: &str) {
        for _ in 0..5 {
            let Admission::Permit(permit) = monitor.allow(tool).unwrap() else {
                panic!("denied before threshold");
            };
            monitor
                .record_and_score(permit, Outcome::Failure, Duration::from_millis(5))
                .unwrap();
        }
    }

    async fn send(router: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_ok_without_failures() {
        let (status, body) = send(create_router(monitor()), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["unavailable"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn health_degrades_when_breaker_opens() {
        let monitor = monitor();
        trip(&monitor, "acgme");
        let (status, body) = send(create_router(monitor), "GET", "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["failing"][0], "acgme");
    }

    #[tokio::test]
    async fn dashboard_lists_tools() {
        let (status, body) = send(create_router(monitor()), "GET", "/dashboard").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tools"]["roster"]["breaker_phase"], "CLOSED");
        assert_eq!(body["tools"]["roster"]["status"], "UNAVAILABLE");
        assert_eq!(body["cache"]["hits"], 0);
        assert_eq!(body["cache"]["size"], 0);
    }

    #[tokio::test]
    async fn reset_closes_breaker() {
        let monitor = monitor();
        trip(&monitor, "acgme");
        let (status, _) = send(create_router(Arc::clone(&monitor)), "POST", "/tools/acgme/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert!(monitor.allow("acgme").unwrap().is_permitted());
    }

    #[tokio::test]
    async fn reset_unknown_tool_is_404() {
        let (status, _) = send(create_router(monitor()), "POST", "/tools/nope/reset").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
