use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct LogTail {
    pub lines: Vec<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/log", get(log_tail))
}

async fn log_tail(State(state): State<AppState>) -> Json<LogTail> {
    Json(LogTail {
        lines: state.log.lines(),
    })
}
