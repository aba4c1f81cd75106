pub mod log;
pub mod nodes;
pub mod provision;
pub mod stats;
pub mod webhook;

use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(provision::router())
        .merge(webhook::router())
        .merge(nodes::router())
        .merge(stats::router())
        .merge(log::router())
}

/// The full service with request tracing.
pub fn app(state: AppState) -> Router {
    router().layer(TraceLayer::new_for_http()).with_state(state)
}
