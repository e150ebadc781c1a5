//! HTTP control surface.

pub mod error;
mod health;
mod v1;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::reconciler::Reconciler;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { reconciler }),
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.inner.reconciler
    }
}

/// Create the router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
