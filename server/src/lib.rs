//! HTTP surface for the sandbox execution service.

pub mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Create the application router.
pub fn create_app() -> Router {
    Router::new()
        // Service info for humans poking at the root
        .route("/", get(routes::service_info))
        // Health check endpoint
        .route("/health", get(health_check))
        // Code execution endpoint
        .route("/execute", post(routes::execute))
        // Add tracing layer
        .layer(TraceLayer::new_for_http())
}

/// Health check handler
async fn health_check() -> &'static str {
    "OK"
}

/// Bind and serve the application until the process is stopped.
pub async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let app = create_app();

    info!("Starting sandbox execution server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
