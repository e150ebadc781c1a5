//! VM endpoints.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::error::NodeError;
use crate::hypervisor::DomainStatus;
use crate::reconciler::CreateVmRequest;
use crate::state::{PowerState, VmSpec};

/// Create VM routes, nested under /v1/vms.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_vm).get(list_vms))
        .route("/{name}", delete(delete_vm))
        .route("/{name}/start", post(start_vm))
        .route("/{name}/stop", post(stop_vm))
        .route("/{name}/status", get(status_vm))
        .route("/{name}/ip", get(vm_ip))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(Deserialize))]
pub struct VmResponse {
    pub ok: bool,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct ListVmsResponse {
    pub ok: bool,
    pub items: Vec<VmSpec>,
}

#[derive(Debug, Serialize)]
pub struct DeleteVmResponse {
    pub ok: bool,
    pub name: String,
    pub deleted_files: bool,
}

#[derive(Debug, Serialize)]
pub struct VmStatusResponse {
    pub ok: bool,
    pub name: String,
    pub state: DomainStatus,
    pub desired: PowerState,
}

#[derive(Debug, Serialize)]
pub struct VmIpResponse {
    pub ok: bool,
    pub name: String,
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct DeleteVmQuery {
    pub delete_files: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VmIpQuery {
    pub network: Option<String>,
    pub timeout: Option<String>,
}

/// `1`, `true` and `yes` enable a flag; anything else disables it.
fn parse_flag(raw: Option<&str>, default: bool) -> bool {
    match raw {
        None => default,
        Some(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
    }
}

fn vm_error(name: &str) -> impl FnOnce(NodeError) -> ApiError + '_ {
    move |e| ApiError::from(e).with_instance(format!("/v1/vms/{name}"))
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /v1/vms
async fn create_vm(
    State(state): State<AppState>,
    payload: Result<Json<CreateVmRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let name = request.name.clone();

    let spec = state
        .reconciler()
        .create_vm(request)
        .await
        .map_err(vm_error(&name))?;

    Ok(Json(VmResponse {
        ok: true,
        name: spec.name,
    }))
}

/// GET /v1/vms
async fn list_vms(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListVmsResponse {
        ok: true,
        items: state.reconciler().list_vms().await,
    })
}

/// DELETE /v1/vms/{name}?delete_files=true
async fn delete_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<DeleteVmQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;
    let delete_files = parse_flag(query.delete_files.as_deref(), true);

    state
        .reconciler()
        .delete_vm(&name, delete_files)
        .await
        .map_err(vm_error(&name))?;

    Ok(Json(DeleteVmResponse {
        ok: true,
        name,
        deleted_files: delete_files,
    }))
}

/// POST /v1/vms/{name}/start
async fn start_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .reconciler()
        .start_vm(&name)
        .await
        .map_err(vm_error(&name))?;

    Ok(Json(VmResponse { ok: true, name }))
}

/// POST /v1/vms/{name}/stop
async fn stop_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .reconciler()
        .stop_vm(&name)
        .await
        .map_err(vm_error(&name))?;

    Ok(Json(VmResponse { ok: true, name }))
}

/// GET /v1/vms/{name}/status
async fn status_vm(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state
        .reconciler()
        .vm_status(&name)
        .await
        .map_err(vm_error(&name))?;

    Ok(Json(VmStatusResponse {
        ok: true,
        name: status.name,
        state: status.state,
        desired: status.desired,
    }))
}

/// GET /v1/vms/{name}/ip?network=&timeout=
async fn vm_ip(
    State(state): State<AppState>,
    Path(name): Path<String>,
    query: Result<Query<VmIpQuery>, QueryRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Query(query) = query?;

    let timeout = query
        .timeout
        .as_deref()
        .map(|raw| {
            raw.trim()
                .parse::<i64>()
                .map_err(|_| NodeError::validation("timeout must be a whole number of seconds"))
        })
        .transpose()
        .map_err(vm_error(&name))?;

    let ip = state
        .reconciler()
        .vm_ip(&name, query.network.as_deref(), timeout)
        .await
        .map_err(vm_error(&name))?;

    Ok(Json(VmIpResponse {
        ok: true,
        name,
        ip: ip.to_string(),
    }))
}
