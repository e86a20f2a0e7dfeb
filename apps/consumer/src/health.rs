use std::net::SocketAddr;

use auditflow_application::{ActionConsumer, ConsumerStats};
use auditflow_core::{AppError, AppResult};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn health_router(consumer: ActionConsumer) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(consumer)
}

pub async fn health_handler(
    State(consumer): State<ActionConsumer>,
) -> (StatusCode, Json<ConsumerStats>) {
    let stats = consumer.stats();
    let status = if stats.status_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(stats))
}

/// Serves `/health` on `port` until `shutdown` flips to true.
pub async fn serve_health(
    port: u16,
    consumer: ActionConsumer,
    mut shutdown: watch::Receiver<bool>,
) -> AppResult<()> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .map_err(|error| AppError::Internal(format!("failed to bind health listener: {error}")))?;

    info!(%address, "health endpoint listening");

    axum::serve(listener, health_router(consumer))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .map_err(|error| AppError::Internal(format!("health server error: {error}")))
}
