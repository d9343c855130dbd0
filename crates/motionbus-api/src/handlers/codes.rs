//! /code, /flush, /lock, /unlock, /emergency-stop, /reset handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use motionbus_core::{Code, Message};
use motionbus_services::CodeError;

use super::{parse_channel, ApiState};

// ── /code (POST) ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CodeRequest {
    pub channel: String,
    pub code: String,
}

#[derive(Serialize)]
pub struct CodeResponse {
    pub code: String,
    pub success: bool,
    pub messages: Vec<Message>,
}

pub async fn handle_code(
    State(state): State<ApiState>,
    Json(req): Json<CodeRequest>,
) -> Result<Json<CodeResponse>, (StatusCode, String)> {
    let channel = parse_channel(&req.channel)?;
    let code = Code::parse(&req.code, channel)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?
        .ok_or((StatusCode::BAD_REQUEST, "line contains no code".to_string()))?;
    let name = code.to_string();

    tracing::debug!(%channel, code = %name, "code via API");
    match state.control.execute(code).await {
        Ok(result) => Ok(Json(CodeResponse {
            code: name,
            success: result.is_successful(),
            messages: result.messages().to_vec(),
        })),
        Err(e @ CodeError::Cancelled(_)) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e @ CodeError::Failed(_)) => Err((StatusCode::UNPROCESSABLE_ENTITY, e.to_string())),
    }
}

// ── /flush, /lock, /unlock (POST) ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct ChannelResponse {
    pub channel: String,
    pub success: bool,
}

pub async fn handle_flush(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
) -> Result<Json<ChannelResponse>, (StatusCode, String)> {
    let ch = parse_channel(&channel)?;
    let success = state.control.flush(ch).await;
    Ok(Json(ChannelResponse { channel, success }))
}

pub async fn handle_lock(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
) -> Result<Json<ChannelResponse>, (StatusCode, String)> {
    let ch = parse_channel(&channel)?;
    let success = state.control.lock(ch).await;
    if success {
        tracing::info!(channel = %ch, "movement locked via API");
    }
    Ok(Json(ChannelResponse { channel, success }))
}

pub async fn handle_unlock(
    State(state): State<ApiState>,
    Path(channel): Path<String>,
) -> Result<Json<ChannelResponse>, (StatusCode, String)> {
    let ch = parse_channel(&channel)?;
    let success = state.control.unlock(ch).await;
    Ok(Json(ChannelResponse { channel, success }))
}

// ── /emergency-stop, /reset (POST) ────────────────────────────────────────────

#[derive(Serialize)]
pub struct RequestedResponse {
    pub message: String,
}

pub async fn handle_emergency_stop(State(state): State<ApiState>) -> Json<RequestedResponse> {
    state.control.request_emergency_stop();
    Json(RequestedResponse {
        message: "Emergency stop requested".to_string(),
    })
}

pub async fn handle_reset(State(state): State<ApiState>) -> Json<RequestedResponse> {
    state.control.request_reset();
    Json(RequestedResponse {
        message: "Reset requested".to_string(),
    })
}
