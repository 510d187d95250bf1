use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ServerState;
use crate::hub::HubStats;

// ============================================================
// Health
// ============================================================

#[derive(Serialize)]
pub(crate) struct HealthReport {
    status: &'static str,
    version: &'static str,
    shutting_down: bool,
    open_connections: usize,
    last_captured_at: Option<DateTime<Utc>>,
    hub: HubStats,
}

pub(crate) async fn handle_health(State(state): State<ServerState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        version: crate::VERSION,
        shutting_down: state.shutdown.is_triggered(),
        open_connections: state.connections.active(),
        last_captured_at: state.hub.latest().map(|s| s.captured_at),
        hub: state.hub.stats(),
    })
}

// ============================================================
// Snapshot
// ============================================================

/// Most recently published snapshot, bare (without the push envelope).
pub(crate) async fn handle_snapshot(
    State(state): State<ServerState>,
) -> Result<Response, StatusCode> {
    let snap = state.hub.latest().ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let json =
        serde_json::to_string(snap.as_ref()).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(([(header::CONTENT_TYPE, "application/json")], json).into_response())
}
