//! HTTP API: scrape endpoint, health and readiness probes

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use exporter_lib::exposition;
use exporter_lib::{Collector, HealthRegistry};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub collector: Arc<Collector>,
    pub health: HealthRegistry,
    pub metric_prefix: String,
    pub metrics_path: String,
}

/// Scrape handler: trigger a coalesced collection cycle, then render
/// whatever the store holds. A failed cycle degrades to the previous
/// snapshot instead of a non-2xx response.
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    if let Err(e) = state.collector.collect().await {
        warn!(error = %e, "Collection cycle failed, serving last snapshot");
    }

    let snapshot = state.collector.store().snapshot();
    match exposition::render(&state.metric_prefix, &snapshot) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failed\n").into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK\n")
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness))
}

async fn index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>GPU Energy Exporter</title></head>\n<body>\n\
         <h1>GPU Energy Exporter</h1>\n\
         <p>Per-process GPU energy metrics</p>\n\
         <ul>\n\
         <li><a href=\"{path}\">Metrics</a></li>\n\
         <li><a href=\"/health\">Health</a></li>\n\
         </ul>\n\
         </body>\n</html>\n",
        path = state.metrics_path
    ))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let metrics_path = state.metrics_path.clone();
    Router::new()
        .route(&metrics_path, get(metrics))
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        .route("/", get(index))
        .with_state(state)
}

/// Serve the API until the shutdown future resolves.
pub async fn serve(
    addr: &str,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
