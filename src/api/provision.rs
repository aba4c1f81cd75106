use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Form, Json, Router};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::certsign::{SigningAction, SigningResult};
use crate::error::ApiError;
use crate::exec::{FormValues, TemplateValues};
use crate::state::AppState;

/// Per-task entry of the `/provision` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub complete: bool,
    pub success: bool,
    pub message: String,
}

impl TaskResult {
    fn queued(what: &str, wait_name: &str) -> Self {
        Self {
            complete: false,
            success: true,
            message: format!(
                "{what} was queued. To see the results in this response, include \"{wait_name}\" in the waits list."
            ),
        }
    }

    fn unrecognized() -> Self {
        Self {
            complete: true,
            success: false,
            message: "Task name is not recognized.".into(),
        }
    }
}

impl From<SigningResult> for TaskResult {
    fn from(result: SigningResult) -> Self {
        Self {
            complete: true,
            success: result.success,
            message: result.message,
        }
    }
}

type Pending = BoxFuture<'static, (String, TaskResult)>;

pub fn router() -> Router<AppState> {
    Router::new().route("/provision", post(provision))
}

fn split_list(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

fn cert_key(action: SigningAction) -> String {
    match action {
        SigningAction::Sign => "cert-sign".into(),
        SigningAction::Revoke => "cert-revoke".into(),
    }
}

/// Resolve once the signing stream reports `action`.
fn await_signing(mut rx: mpsc::Receiver<SigningResult>, action: SigningAction) -> Pending {
    async move {
        while let Some(result) = rx.recv().await {
            if result.action == action {
                return (cert_key(action), result.into());
            }
        }
        let lost = TaskResult {
            complete: false,
            success: false,
            message: "The certificate queue stopped before reporting a result.".into(),
        };
        (cert_key(action), lost)
    }
    .boxed()
}

#[tracing::instrument(skip(state, form), fields(hostname = tracing::field::Empty), err)]
async fn provision(
    State(state): State<AppState>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<BTreeMap<String, TaskResult>>, ApiError> {
    let hostname = form
        .get("hostname")
        .map(|h| h.trim().to_owned())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ApiError::BadRequest("No hostname provided.".into()))?;
    tracing::Span::current().record("hostname", hostname.as_str());

    let tasks = split_list(form.get("tasks"));
    if tasks.is_empty() {
        return Err(ApiError::BadRequest("No tasks provided.".into()));
    }
    let waits: HashSet<String> = split_list(form.get("waits")).into_iter().collect();

    let mut info = format!("Provisioning {hostname}");
    if tasks.iter().any(|t| t == "environment") {
        let environment = form
            .get("environment")
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                ApiError::BadRequest(
                    "Environment provisioning was listed in tasks, but the target environment was not given."
                        .into(),
                )
            })?;
        info.push_str(&format!(" in the {environment} environment"));
    }
    state.notifier.notify(&format!("{info}..."));

    let mut response = BTreeMap::new();
    let mut pending: Vec<Pending> = Vec::new();

    let cert_sign = tasks.iter().any(|t| t == "cert" || t == "cert-sign");
    let cert_revoke = tasks.iter().any(|t| t == "cert-revoke")
        || form
            .get("cert-revoke")
            .is_some_and(|v| !v.is_empty() && v != "false");

    if cert_revoke {
        let rx = state.signer.clean(&hostname).await;
        if waits.contains("cert-revoke") {
            pending.push(await_signing(rx, SigningAction::Revoke));
        } else {
            response.insert(
                "cert-revoke".to_owned(),
                TaskResult::queued("Certificate cleaning operation", "cert-revoke"),
            );
        }
    }

    if cert_sign {
        let rx = state.signer.sign(&hostname, false).await;
        if waits.contains("cert") || waits.contains("cert-sign") {
            pending.push(await_signing(rx, SigningAction::Sign));
        } else {
            response.insert(
                "cert-sign".to_owned(),
                TaskResult::queued("Certificate signing operation", "cert-sign"),
            );
        }
    }

    let values: Arc<dyn TemplateValues> = Arc::new(FormValues::from(form.clone()));
    for task in tasks
        .iter()
        .filter(|t| !matches!(t.as_str(), "cert" | "cert-sign" | "cert-revoke"))
    {
        if !state.exec.is_configured(task) {
            response.insert(task.clone(), TaskResult::unrecognized());
            continue;
        }
        let correlation_id = uuid::Uuid::new_v4().to_string();
        match state.exec.run(task, Arc::clone(&values), &correlation_id).await {
            Ok(rx) if waits.contains(task) => {
                let name = task.clone();
                pending.push(
                    async move {
                        let result = match rx.await {
                            Ok(result) => TaskResult {
                                complete: true,
                                success: result.exit_code == 0,
                                message: result.message,
                            },
                            Err(_) => TaskResult {
                                complete: false,
                                success: false,
                                message: "The task queue stopped before reporting a result.".into(),
                            },
                        };
                        (name, result)
                    }
                    .boxed(),
                );
            }
            Ok(_) => {
                response.insert(task.clone(), TaskResult::queued("Task", task));
            }
            Err(e) => {
                response.insert(
                    task.clone(),
                    TaskResult {
                        complete: true,
                        success: false,
                        message: e.to_string(),
                    },
                );
            }
        }
    }

    response.extend(join_all(pending).await);
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_trims_and_drops_empty() {
        let value = " cert , deploy,,".to_owned();
        assert_eq!(split_list(Some(&value)), vec!["cert", "deploy"]);
        assert!(split_list(None).is_empty());
    }

    #[test]
    fn queued_message_names_wait_key() {
        let result = TaskResult::queued("Certificate signing operation", "cert-sign");
        assert!(!result.complete);
        assert_eq!(
            result.message,
            "Certificate signing operation was queued. To see the results in this response, include \"cert-sign\" in the waits list."
        );
    }
}
