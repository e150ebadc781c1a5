//! API v1 routes.

mod ports;
mod vms;

use axum::Router;

use super::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/vms", vms::routes())
        .nest("/ports", ports::routes())
}
