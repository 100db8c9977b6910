//! Axum server setup and router configuration.

use crate::state::AppState;
use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use kanau::processor::Processor;
use pickup_core::entities::outbox::{CountOutboxByStatus, OutboxStatus};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Liveness: OK as long as the process serves requests.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    database: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outbox_pending: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outbox_failed: Option<i64>,
}

/// Readiness: the database answers. Also reports the outbox backlog.
async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    let db = state.store.processor();
    if let Err(e) = sqlx::query("SELECT 1").execute(&db.pool).await {
        tracing::warn!(error = %e, "Readiness check failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "unavailable",
                database: "unreachable",
                outbox_pending: None,
                outbox_failed: None,
            }),
        );
    }

    let pending = db
        .process(CountOutboxByStatus {
            status: OutboxStatus::Created,
        })
        .await
        .ok();
    let failed = db
        .process(CountOutboxByStatus {
            status: OutboxStatus::Failed,
        })
        .await
        .ok();

    (
        StatusCode::OK,
        Json(ReadyResponse {
            status: "ready",
            database: "ok",
            outbox_pending: pending,
            outbox_failed: failed,
        }),
    )
}

/// Run the server until `shutdown` is cancelled.
pub async fn run_server(
    router: Router,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
