use std::time::Duration;

use serde_json::{Value, json};

use super::ChatKind;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Request body for one chat message.
///
/// Slack reads `&`, `<` and `>` as link and mention markup, so they are
/// escaped and mrkdwn formatting is switched off. Google Chat takes the text
/// as is.
fn payload(kind: ChatKind, text: &str) -> Value {
    match kind {
        ChatKind::GoogleChat => json!({ "text": text }),
        ChatKind::Slack => {
            let escaped = text
                .replace('&', "&amp;")
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            json!({ "text": escaped, "mrkdwn": false })
        }
    }
}

/// Post one message to a chat incoming-webhook URL.
#[tracing::instrument(skip(client, text))]
pub(super) async fn deliver(client: &reqwest::Client, kind: ChatKind, url: &str, text: &str) {
    if text.is_empty() {
        return;
    }
    let payload = payload(kind, text);

    let request = client
        .post(url)
        .timeout(DELIVERY_TIMEOUT)
        .header("Content-Type", "application/json; charset=UTF-8")
        .json(&payload);

    match request.send().await {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(status = resp.status().as_u16(), "notification delivered");
        }
        Ok(resp) => {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status, %body, "notification webhook rejected message");
        }
        Err(e) => {
            tracing::warn!(error = %e, "notification webhook delivery failed");
        }
    }
}
