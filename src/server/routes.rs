use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::bridge::BridgeStatus;
use crate::device::DeviceSnapshot;
use crate::errors::RelayError;
use crate::permissions::GrantStatus;
use crate::relay::protocol::DeviceReply;
use crate::relay::{ConnectionInfo, RelayStats};

#[derive(Debug, Deserialize)]
pub(super) struct DeviceRequest {
    command: String,
}

/// HTTP status for a failed device command.
pub(crate) fn status_for(err: &RelayError) -> StatusCode {
    match err {
        RelayError::MalformedMessage(_) => StatusCode::BAD_REQUEST,
        RelayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(super) async fn device_command(
    State(state): State<AppState>,
    Path(device): Path<String>,
    body: Result<Json<DeviceRequest>, JsonRejection>,
) -> (StatusCode, Json<DeviceReply>) {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(DeviceReply::error(rejection.body_text())),
            )
        }
    };

    match state.hub.device_command(&request.command, &device).await {
        Ok(message) => (StatusCode::OK, Json(DeviceReply::success(message))),
        Err(e) => {
            log::warn!("HTTP device command {} {} failed: {}", request.command, device, e);
            (status_for(&e), Json(DeviceReply::error(e.user_message())))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub name: &'static str,
    pub version: &'static str,
    pub uptime_secs: i64,
    pub driver: String,
    pub devices: Vec<DeviceSnapshot>,
    pub connections: Vec<ConnectionInfo>,
    pub stats: RelayStats,
    pub bridge: Option<BridgeStatus>,
}

pub(super) async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.status_report())
}

pub(super) async fn permissions(State(state): State<AppState>) -> Json<Vec<GrantStatus>> {
    Json(state.hub.gate.grants())
}

pub(super) async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
    }))
}
