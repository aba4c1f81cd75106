use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::classify::{ClassifyRequest, EnvironmentsMsg, NodeConfig, NodeConfigResult, RolesMsg};
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/nodes/{node}", get(get_node))
        .route("/api/nodes/{node}/classification", post(classify_node))
        .route("/api/environments", get(list_environments))
        .route("/api/environments/{environment}/roles", get(list_roles))
}

#[derive(Debug, Deserialize)]
struct NodeQuery {
    #[serde(default)]
    missing_ok: bool,
}

#[derive(Debug, Deserialize)]
struct ClassifyBody {
    environment: String,
    #[serde(default)]
    primary_role: String,
    #[serde(default)]
    missing_ok: bool,
    requestor_name: Option<String>,
    requestor_email: Option<String>,
}

async fn get_node(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Query(query): Query<NodeQuery>,
) -> Result<Json<NodeConfig>, ApiError> {
    let config = state
        .classifier()?
        .get_classification(&node, query.missing_ok)
        .await?;
    Ok(Json(config))
}

/// Classify and wait for the outcome, deploy correlation included.
#[tracing::instrument(skip(state, body), err)]
async fn classify_node(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Json(body): Json<ClassifyBody>,
) -> Result<Json<NodeConfigResult>, ApiError> {
    if body.environment.trim().is_empty() {
        return Err(ApiError::BadRequest("environment is required".into()));
    }
    let request = ClassifyRequest {
        node,
        environment: body.environment,
        primary_role: body.primary_role,
        missing_ok: body.missing_ok,
        requestor_name: body.requestor_name,
        requestor_email: body.requestor_email,
    };
    let rx = state.classifier()?.classify(request).await;
    let result = rx
        .await
        .map_err(|_| ApiError::ServiceUnavailable("classification queue stopped".into()))?;
    Ok(Json(result))
}

async fn list_environments(State(state): State<AppState>) -> Result<Json<EnvironmentsMsg>, ApiError> {
    Ok(Json(state.classifier()?.get_environments().await))
}

async fn list_roles(
    State(state): State<AppState>,
    Path(environment): Path<String>,
) -> Result<Json<RolesMsg>, ApiError> {
    Ok(Json(state.classifier()?.get_roles(&environment).await))
}
