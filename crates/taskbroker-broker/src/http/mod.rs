//! HTTP server for the broker.
//!
//! Provides endpoints for:
//! - Runner connections (`/runners/_ws?id=<runnerId>`)
//! - Requester connections (`/requesters/_ws?id=<requesterId>`)
//! - Runner list API (`/v1/runners`)
//! - Task list API (`/v1/tasks`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::Broker;

mod handlers;
pub mod responses;
mod ws;

/// Create the HTTP router.
pub fn create_router(broker: Broker) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Protocol routes
        .route("/runners/_ws", get(ws::runner_ws))
        .route("/requesters/_ws", get(ws::requester_ws))
        // API routes
        .route("/v1/runners", get(handlers::list_runners))
        .route("/v1/tasks", get(handlers::list_tasks))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(broker)
}
