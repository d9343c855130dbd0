//! /status, /diagnostics, /daemon/shutdown handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use motionbus_core::status::LinkStatus;

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

pub async fn handle_status(State(state): State<ApiState>) -> Json<LinkStatus> {
    Json(state.control.status().await)
}

// ── /diagnostics ──────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct DiagnosticsResponse {
    /// One line per channel with queued, buffered or macro work.
    pub channels: Vec<String>,
}

pub async fn handle_diagnostics(State(state): State<ApiState>) -> Json<DiagnosticsResponse> {
    let channels = state
        .control
        .diagnostics()
        .await
        .lines()
        .map(str::to_string)
        .collect();
    Json(DiagnosticsResponse { channels })
}

// ── /daemon/shutdown ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub message: String,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let _ = state.shutdown_tx.send(());

    Json(ShutdownResponse {
        message: "Shutdown initiated".to_string(),
    })
}
