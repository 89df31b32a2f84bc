//! HTTP bridge
//!
//! The dashboard polls `GET /api/connections`; every feature that needs the
//! remote hosts goes through `POST /api/connections/{hostId}/exec`.

use std::future::Future;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::commands::{DiagnosticsReporter, DiagnosticsSnapshot, HostDiagnostics};
use crate::ssh::{CommandExecutor, CommandResult, ConnectionRegistryError, HostStatus};

#[derive(Clone)]
pub struct AppState {
    pub reporter: DiagnosticsReporter,
    pub executor: CommandExecutor,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Registry(#[from] ConnectionRegistryError),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Registry(e) => match e {
                ConnectionRegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                ConnectionRegistryError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ConnectionRegistryError::HostFailed { .. }
                | ConnectionRegistryError::ConnectionLost(_) => StatusCode::SERVICE_UNAVAILABLE,
                ConnectionRegistryError::Cancelled => StatusCode::CONFLICT,
                ConnectionRegistryError::ChannelError(_) => StatusCode::BAD_GATEWAY,
            },
        };

        let body = serde_json::json!({
            "error": self.to_string()
        });

        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub command: String,
    pub timeout_ms: Option<u64>,
}

/// Body of the 202 returned by the manual controls
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlAccepted {
    pub host_id: String,
    pub status: HostStatus,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/connections", get(list_connections))
        .route("/api/connections/{host_id}", get(get_connection))
        .route("/api/connections/{host_id}/retry", post(retry_connection))
        .route("/api/connections/{host_id}/reset", post(reset_connection_state))
        .route("/api/connections/{host_id}/exec", post(execute))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!("HTTP bridge listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn list_connections(State(state): State<AppState>) -> Json<DiagnosticsSnapshot> {
    Json(state.reporter.snapshot())
}

async fn get_connection(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<Json<HostDiagnostics>> {
    Ok(Json(state.reporter.host_snapshot(&host_id)?))
}

async fn retry_connection(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<(StatusCode, Json<ControlAccepted>)> {
    let status = state.reporter.retry_now(&host_id)?;
    Ok((StatusCode::ACCEPTED, Json(ControlAccepted { host_id, status })))
}

async fn reset_connection_state(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
) -> Result<(StatusCode, Json<ControlAccepted>)> {
    state.reporter.reset(&host_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ControlAccepted {
            host_id,
            status: HostStatus::Disconnected,
        }),
    ))
}

async fn execute(
    State(state): State<AppState>,
    Path(host_id): Path<String>,
    Json(req): Json<ExecRequest>,
) -> Result<Json<CommandResult>> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("command must not be empty".to_string()));
    }
    if req.timeout_ms == Some(0) {
        return Err(ApiError::BadRequest("timeoutMs must be positive".to_string()));
    }

    let timeout = req.timeout_ms.map(Duration::from_millis);
    match state.executor.execute(&host_id, &req.command, timeout).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            warn!("exec on {} failed: {}", host_id, e);
            Err(e.into())
        }
    }
}
