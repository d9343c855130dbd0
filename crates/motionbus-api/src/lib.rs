pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::handle_status))
        .route("/diagnostics", get(handlers::handle_diagnostics))
        .route("/code", post(handlers::handle_code))
        .route("/flush/{channel}", post(handlers::handle_flush))
        .route("/lock/{channel}", post(handlers::handle_lock))
        .route("/unlock/{channel}", post(handlers::handle_unlock))
        .route("/emergency-stop", post(handlers::handle_emergency_stop))
        .route("/reset", post(handlers::handle_reset))
        .route("/daemon/shutdown", post(handlers::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
