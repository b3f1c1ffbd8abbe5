use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::relay::{RelayError, RequestOrchestrator};

type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: RequestOrchestrator,
}

impl AppState {
    pub fn new(orchestrator: RequestOrchestrator) -> Self {
        Self { orchestrator }
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": crate::VERSION}))
}

/// Push delivery of one queue event. 2xx and 4xx acknowledge the message,
/// 5xx asks the sender to redeliver.
async fn handle_event(State(state): State<SharedState>, body: String) -> impl IntoResponse {
    match state.orchestrator.handle(&body).await {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => error_response(&err).into_response(),
    }
}

fn error_response(err: &RelayError) -> (StatusCode, Json<serde_json::Value>) {
    let status = if err.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "kind": err.kind(),
            "retryable": err.is_retryable(),
        })),
    )
}

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/events", post(handle_event))
        .with_state(state)
}

pub async fn serve(orchestrator: RequestOrchestrator, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(orchestrator));
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining in-flight requests");
        })
        .into_future()
        .await?;
    Ok(())
}
