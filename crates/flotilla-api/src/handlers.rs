//! API handlers.
//!
//! Every handler reads or writes through the store connection and
//! returns JSON in a uniform `{success, data, error}` envelope.
//! Deploy-time validation failures come back synchronously as 400s;
//! they are never logged-and-ignored.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::info;

use flotilla_blueprint::Blueprint;
use flotilla_cloud::{valid_regions, ALL_PROVIDERS};
use flotilla_state::{StoreError, TableType};

use crate::ApiState;

/// Response wrapper for a consistent API shape.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

// ── Queries ────────────────────────────────────────────────────────

/// GET /api/v1/machines
pub async fn query_machines(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.conn.machines(|_| true))
}

/// GET /api/v1/containers
pub async fn query_containers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.conn.containers(|_| true))
}

/// GET /api/v1/connections
pub async fn query_connections(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.conn.connections(|_| true))
}

/// GET /api/v1/loadbalancers
pub async fn query_load_balancers(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.conn.load_balancers(|_| true))
}

/// GET /api/v1/etcd
pub async fn query_etcd(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.conn.etcd().ok())
}

/// GET /api/v1/blueprints
pub async fn query_blueprints(State(state): State<ApiState>) -> impl IntoResponse {
    let blueprints: Vec<Blueprint> = state
        .conn
        .blueprint()
        .ok()
        .map(|row| row.blueprint)
        .into_iter()
        .collect();
    ApiResponse::ok(blueprints)
}

/// GET /api/v1/images
pub async fn query_images(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.conn.images(|_| true))
}

// ── Deploy ─────────────────────────────────────────────────────────

/// POST /api/v1/deploy — parse, validate, and store a blueprint.
pub async fn deploy(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let mut bp = match Blueprint::from_json(&body) {
        Ok(bp) => bp,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    };

    if let Err(msg) = check_providers(&mut bp) {
        return error_response(&msg, StatusCode::BAD_REQUEST).into_response();
    }

    let namespace = bp.namespace.clone();
    let result = state
        .conn
        .txn(&[TableType::Blueprint])
        .run(|view| -> Result<(), StoreError> {
            let mut row = match view.blueprint() {
                Ok(row) => row,
                Err(_) => view.insert_blueprint(),
            };
            row.blueprint = bp.clone();
            view.commit_blueprint(row);
            Ok(())
        });

    match result {
        Ok(()) => {
            info!(%namespace, "blueprint deployed");
            ApiResponse::ok("deployed").into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// Reject unknown providers and regions up front; machines that leave
/// the region blank get the provider's first one.
fn check_providers(bp: &mut Blueprint) -> Result<(), String> {
    for machine in &mut bp.machines {
        if !ALL_PROVIDERS.contains(&machine.provider.as_str()) {
            return Err(format!(
                "machine {:?}: unknown provider {:?}",
                machine.id, machine.provider
            ));
        }
        let regions = valid_regions(&machine.provider);
        if machine.region.is_empty() {
            machine.region = regions[0].to_string();
        } else if !regions.contains(&machine.region.as_str()) {
            return Err(format!(
                "machine {:?}: unknown region {:?} for provider {}",
                machine.id, machine.region, machine.provider
            ));
        }
    }
    Ok(())
}

// ── Version ────────────────────────────────────────────────────────

/// GET /api/v1/version
pub async fn version() -> impl IntoResponse {
    ApiResponse::ok(env!("CARGO_PKG_VERSION"))
}
