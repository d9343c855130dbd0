//! HTTP API handlers — exposes the channel store and link status as JSON.

pub mod codes;
pub mod status;

use axum::http::StatusCode;

use motionbus_core::CodeChannel;
use motionbus_services::ControlHandle;

#[derive(Clone)]
pub struct ApiState {
    pub control: ControlHandle,
    /// Shutdown broadcast sender — signals graceful daemon shutdown.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Parse a channel name such as "http" or "file".
fn parse_channel(name: &str) -> Result<CodeChannel, (StatusCode, String)> {
    name.parse()
        .map_err(|e: motionbus_core::ParseError| (StatusCode::BAD_REQUEST, e.to_string()))
}

// Re-export handler functions for use in router setup.
pub use codes::{
    handle_code, handle_emergency_stop, handle_flush, handle_lock, handle_reset, handle_unlock,
};
pub use status::{handle_diagnostics, handle_shutdown, handle_status};
