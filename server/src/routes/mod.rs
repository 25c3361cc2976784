//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One routing unit per process: the room endpoint (WebSocket attach and
//! HTTP passthrough share a path) plus a health probe, behind permissive
//! CORS and request tracing.

pub mod rooms;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{any, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/rooms/{room}", any(rooms::handle_room))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
