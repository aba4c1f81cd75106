//! Human-facing notifications fanned out to chat webhooks and in-process
//! subscribers.

mod webhook;

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NotificationConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub webhooks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChatKind {
    GoogleChat,
    Slack,
}

#[derive(Debug)]
enum Target {
    Chat {
        kind: ChatKind,
        url: String,
    },
    Channel(mpsc::UnboundedSender<String>),
}

/// Cheap to clone; every component holds its own handle.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    targets: Arc<Vec<Target>>,
    client: reqwest::Client,
}

impl Notifier {
    /// A notifier that only logs.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A notifier delivering every message to the returned receiver.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let notifier = Self {
            targets: Arc::new(vec![Target::Channel(tx)]),
            client: reqwest::Client::default(),
        };
        (notifier, rx)
    }

    pub fn from_config(configs: &[NotificationConfig]) -> Self {
        let mut targets = Vec::new();
        for cfg in configs {
            let kind = match cfg.kind.as_str() {
                "gchat" => ChatKind::GoogleChat,
                "slack" => ChatKind::Slack,
                other => {
                    tracing::warn!(kind = other, "unsupported notification type, skipping");
                    continue;
                }
            };
            if cfg.webhooks.is_empty() {
                tracing::warn!(kind = %cfg.kind, "notification target has no webhooks, skipping");
                continue;
            }
            tracing::info!(kind = %cfg.kind, webhooks = cfg.webhooks.len(), "notifications configured");
            targets.extend(cfg.webhooks.iter().map(|url| Target::Chat {
                kind,
                url: url.clone(),
            }));
        }
        Self {
            targets: Arc::new(targets),
            client: reqwest::Client::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.targets.is_empty()
    }

    /// Log the message and hand it to every target. Webhook delivery runs in
    /// the background; failures are logged only.
    pub fn notify(&self, message: &str) {
        tracing::info!(notification = %message, "notify");
        for target in self.targets.iter() {
            match target {
                Target::Channel(tx) => {
                    let _ = tx.send(message.to_owned());
                }
                Target::Chat { kind, url } => {
                    let Ok(handle) = tokio::runtime::Handle::try_current() else {
                        tracing::warn!(url, "no runtime available for notification delivery");
                        continue;
                    };
                    let client = self.client.clone();
                    let url = url.clone();
                    let text = message.to_owned();
                    let kind = *kind;
                    handle.spawn(async move {
                        webhook::deliver(&client, kind, &url, &text).await;
                    });
                }
            }
        }
    }
}
