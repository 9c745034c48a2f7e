//! # jotter-api
//!
//! HTTP and WebSocket surface of the jotter request pipeline: admission
//! with per-identity rate limits, pull-based status queries, cancellation,
//! and real-time job events from the notification hub.

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod services;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub use auth::{AuthUser, Claims, TokenSigner};
pub use config::{ServerConfig, StorageBackend};
pub use error::ApiError;
pub use state::AppState;

/// Build the application router.
///
/// CORS is left to the caller since allowed origins are deployment config.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/api/v1/spaces/:space_id/requests",
            post(handlers::submit_request),
        )
        .route(
            "/api/v1/spaces/:space_id/queue",
            get(handlers::space_queue_status),
        )
        .route("/api/v1/quick/requests", post(handlers::quick_submit))
        .route("/api/v1/requests/:id", get(handlers::get_request))
        .route("/api/v1/requests/:id/cancel", post(handlers::cancel_request))
        .route("/api/v1/requests/:id/position", get(handlers::get_position))
        .route("/api/v1/queue/stats", get(handlers::queue_stats))
        .route("/api/v1/ws", get(handlers::ws_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}
