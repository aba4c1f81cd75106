use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tower_http::limit::RequestBodyLimitLayer;

use crate::error::ApiError;
use crate::events::WebhookResult;
use crate::exec::{JsonValues, TemplateValues};
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
const EVENT_HEADER: &str = "X-GitHub-Event";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";

type HmacSha256 = Hmac<Sha256>;

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/webhook",
        post(github_webhook).layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
    )
}

fn keyed(secret: &str, body: &[u8]) -> Result<HmacSha256, ApiError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("webhook secret: {e}")))?;
    mac.update(body);
    Ok(mac)
}

/// `sha256=<hex>` signature GitHub sends for `body` under `secret`.
pub fn signature(secret: &str, body: &[u8]) -> Result<String, ApiError> {
    let mac = keyed(secret, body)?;
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn verify_signature(secret: &str, body: &[u8], header: &str) -> Result<(), ApiError> {
    let expected = header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
        .ok_or(ApiError::Forbidden)?;
    keyed(secret, body)?
        .verify_slice(&expected)
        .map_err(|_| ApiError::Forbidden)
}

#[tracing::instrument(skip_all, fields(event = tracing::field::Empty), err)]
async fn github_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<String, ApiError> {
    let event = headers
        .get(EVENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::BadRequest(
                "This listener accepts only requests compliant with the GitHub webhook API, including the X-GitHub-Event header."
                    .into(),
            )
        })?
        .to_owned();
    tracing::Span::current().record("event", event.as_str());

    if let Some(secret) = state.config.webhooks.secret.as_deref().filter(|s| !s.is_empty()) {
        let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
            tracing::warn!("unsigned webhook rejected");
            return Err(ApiError::Unauthorized);
        };
        if let Err(e) = verify_signature(secret, &body, signature) {
            tracing::warn!("webhook signature mismatch");
            return Err(e);
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("The request body was not valid JSON.".into()))?;
    let values = Arc::new(JsonValues::new(payload));
    let commit_ids = values.strings("$.commits[:].id");

    let mut matched = 0usize;
    for listener in state.listeners.iter().filter(|l| l.event == event) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        state
            .bus
            .publish_webhook(WebhookResult {
                event: event.clone(),
                commit_ids: commit_ids.clone(),
                correlation_id: correlation_id.clone(),
            })
            .await;

        let task_values: Arc<dyn TemplateValues> = values.clone();
        if let Err(e) = state
            .exec
            .run(&listener.exec_task.name, task_values, &correlation_id)
            .await
        {
            tracing::error!(error = %e, task = %listener.exec_task.name, "webhook listener task not started");
        }
        matched += 1;
    }

    tracing::info!(matched, commits = commit_ids.len(), "GitHub webhook processed");
    Ok(format!("{matched} listeners matched."))
}
