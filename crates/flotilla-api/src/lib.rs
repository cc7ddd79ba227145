//! flotilla-api — the controller's query and deploy service.
//!
//! A read-biased HTTP API over the state store: one query endpoint per
//! table, `POST /api/v1/deploy` to submit a blueprint, and a version
//! endpoint. The daemon mounts the router on a UNIX socket by default
//! or TCP for remote use.

pub mod handlers;

use axum::routing::{get, post};
use axum::Router;

use flotilla_state::Conn;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub conn: Conn,
}

/// Build the API router.
pub fn build_router(conn: Conn) -> Router {
    Router::new()
        .route("/api/v1/machines", get(handlers::query_machines))
        .route("/api/v1/containers", get(handlers::query_containers))
        .route("/api/v1/connections", get(handlers::query_connections))
        .route("/api/v1/loadbalancers", get(handlers::query_load_balancers))
        .route("/api/v1/etcd", get(handlers::query_etcd))
        .route("/api/v1/blueprints", get(handlers::query_blueprints))
        .route("/api/v1/images", get(handlers::query_images))
        .route("/api/v1/deploy", post(handlers::deploy))
        .route("/api/v1/version", get(handlers::version))
        .with_state(ApiState { conn })
}
