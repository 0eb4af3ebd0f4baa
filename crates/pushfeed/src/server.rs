use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use pushfeed_client::encode_metrics;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub endpoint: String,
    pub connected: bool,
}

/// Shared state for health endpoints
#[derive(Clone)]
pub struct ServerState {
    pub endpoint: String,
    pub connected: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ServerState {
    pub fn new<F>(endpoint: impl Into<String>, connected: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            endpoint: endpoint.into(),
            connected: Arc::new(connected),
        }
    }
}

/// Health endpoint - always returns 200 if server is running
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        endpoint: state.endpoint.clone(),
        connected: (state.connected)(),
    })
}

/// Ready endpoint - returns 200 only while the stream is connected
async fn ready(State(state): State<ServerState>) -> (StatusCode, Json<HealthResponse>) {
    let connected = (state.connected)();
    let status_code = if connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if connected { "ready" } else { "not_ready" }.to_string(),
            endpoint: state.endpoint.clone(),
            connected,
        }),
    )
}

/// Metrics endpoint - returns Prometheus text format
async fn metrics() -> impl IntoResponse {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {}", e),
        ),
    }
}

/// Create the health server router
pub fn create_router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
pub async fn run_server(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}
