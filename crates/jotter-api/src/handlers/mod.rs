//! HTTP and WebSocket handlers for jotter-api.

pub mod requests;
pub mod ws;

use axum::response::IntoResponse;
use axum::Json;

pub use requests::{
    cancel_request, get_position, get_request, queue_stats, quick_submit, space_queue_status,
    submit_request,
};
pub use ws::ws_handler;

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
