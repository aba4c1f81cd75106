use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::events::BusSnapshot;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Stats {
    pub uptime_secs: u64,
    pub cert_signing_backlog: usize,
    pub classification_backlog: usize,
    #[serde(flatten)]
    pub correlation: BusSnapshot,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/stats", get(stats))
}

async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(Stats {
        uptime_secs: state.started_at.elapsed().as_secs(),
        cert_signing_backlog: state.signer.backlog_len(),
        classification_backlog: state.classifier.as_ref().map_or(0, |c| c.backlog_len()),
        correlation: state.bus.snapshot(),
    })
}
