//! Port-forward endpoints.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    routing::{delete, post},
    Json, Router,
};
use serde::Serialize;
use vmnode_reconcile::ItemFailure;

use crate::api::error::ApiError;
use crate::api::AppState;
use crate::reconciler::{parse_port, CreatePortRuleRequest};
use crate::state::PortRule;

/// Create port routes, nested under /v1/ports.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_port_rule).get(list_port_rules))
        .route("/restore", post(restore_port_rules))
        .route("/{listen_port}", delete(delete_port_rule))
}

#[derive(Debug, Serialize)]
pub struct PortRuleResponse {
    pub ok: bool,
    pub rule_id: String,
    pub rule: PortRule,
}

#[derive(Debug, Serialize)]
pub struct ListPortRulesResponse {
    pub ok: bool,
    pub rules: Vec<PortRule>,
}

#[derive(Debug, Serialize)]
pub struct DeletePortRuleResponse {
    pub ok: bool,
    pub deleted: bool,
    pub rule_id: String,
}

#[derive(Debug, Serialize)]
pub struct RestoreResponse {
    pub ok: bool,
    pub restored: usize,
    pub missing_before: Option<usize>,
    pub failed: Vec<ItemFailure<u16>>,
}

/// POST /v1/ports
async fn create_port_rule(
    State(state): State<AppState>,
    payload: Result<Json<CreatePortRuleRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let rule = state.reconciler().create_port_rule(request).await?;

    Ok(Json(PortRuleResponse {
        ok: true,
        rule_id: rule.listen_port.to_string(),
        rule,
    }))
}

/// GET /v1/ports
async fn list_port_rules(State(state): State<AppState>) -> impl IntoResponse {
    Json(ListPortRulesResponse {
        ok: true,
        rules: state.reconciler().list_port_rules().await,
    })
}

/// DELETE /v1/ports/{listen_port}
async fn delete_port_rule(
    State(state): State<AppState>,
    Path(listen_port): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let listen_port = parse_port("listen_port", &listen_port)?;
    state.reconciler().delete_port_rule(listen_port).await?;

    Ok(Json(DeletePortRuleResponse {
        ok: true,
        deleted: true,
        rule_id: listen_port.to_string(),
    }))
}

/// POST /v1/ports/restore
async fn restore_port_rules(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.reconciler().restore_port_rules().await;

    Json(RestoreResponse {
        ok: true,
        restored: summary.restored_count,
        missing_before: summary.missing_before,
        failed: summary.failed,
    })
}
