//! HTTP + WebSocket surface: read endpoints, inbound event ingestion, and
//! the live event stream, assembled onto one axum `Router`.
//!
//! Grounded on `backend/src/api/mod.rs`'s route table (flat `.route(...)`
//! chain, `tower-http` trace/timeout/cors layers, `.with_state(state)` at
//! the end) rather than nested `Router::merge` per subsystem — this
//! surface is small enough that one table reads more clearly.

pub mod http;
pub mod ws;

use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/tokens/summary", get(http::tokens_summary))
        .route("/api/tokens/by-project", get(http::tokens_by_project))
        .route("/api/tokens/by-type", get(http::tokens_by_type))
        .route("/api/tokens/time-series", get(http::tokens_time_series))
        .route("/api/tokens/compression", get(http::tokens_compression))
        .route("/api/tokens/projection", get(http::tokens_projection))
        .route("/api/performance/queue", get(http::performance_queue))
        .route("/api/performance/times", get(http::performance_times))
        .route("/api/events", post(http::ingest_event))
        .route("/api/live", get(ws::live_events_handler))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
