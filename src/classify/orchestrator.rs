use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::error::ClassifyError;
use super::git::{Author, NodesRepository};
use super::listing::{self, EnvironmentsMsg, RolesMsg};
use super::node_config::{self, NodeConfig};
use crate::events::{CommitWait, EventBus};
use crate::notifications::Notifier;

const QUEUE_DEPTH: usize = 100;
const RESULT_BROADCAST_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub nodes_dir: PathBuf,
    pub environment_path: Vec<PathBuf>,
    pub webhook_timeout: Duration,
    pub exec_timeout: Duration,
    pub default_author: Author,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyRequest {
    pub node: String,
    pub environment: String,
    pub primary_role: String,
    pub missing_ok: bool,
    pub requestor_name: Option<String>,
    pub requestor_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfigResult {
    pub action: String,
    pub success: bool,
    pub message: String,
    pub node: String,
    pub environment: String,
    pub primary_role: String,
}

impl NodeConfigResult {
    fn failed(node: &str, message: String) -> Self {
        Self {
            action: "classify".into(),
            success: false,
            message,
            node: node.to_owned(),
            environment: String::new(),
            primary_role: String::new(),
        }
    }

    fn succeeded(request: &ClassifyRequest, message: String) -> Self {
        Self {
            action: "classify".into(),
            success: true,
            message,
            node: request.node.clone(),
            environment: request.environment.clone(),
            primary_role: request.primary_role.clone(),
        }
    }
}

struct Job {
    request: ClassifyRequest,
    sink: oneshot::Sender<NodeConfigResult>,
}

/// Outcome of the git stage of a classification.
enum Staged {
    Done(NodeConfigResult),
    /// Pushed; the deploy still has to be correlated.
    Pushed(NodeConfigResult, CommitWait),
}

/// Front door of node classification. Git mutations run on one consumer;
/// deploy correlation for each pushed commit runs on its own task.
pub struct ClassificationOrchestrator {
    tx: mpsc::Sender<Job>,
    results: broadcast::Sender<NodeConfigResult>,
    settings: Arc<ClassifierSettings>,
}

#[derive(Clone)]
struct ClassifyWorker {
    settings: Arc<ClassifierSettings>,
    repo: Arc<dyn NodesRepository>,
    bus: EventBus,
    notifier: Notifier,
    results: broadcast::Sender<NodeConfigResult>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

impl ClassificationOrchestrator {
    pub fn start(
        settings: ClassifierSettings,
        repo: Arc<dyn NodesRepository>,
        bus: EventBus,
        notifier: Notifier,
    ) -> Self {
        tracing::info!(
            nodes_dir = %settings.nodes_dir.display(),
            webhook_timeout_secs = settings.webhook_timeout.as_secs(),
            exec_timeout_secs = settings.exec_timeout.as_secs(),
            "starting classification queue"
        );
        let settings = Arc::new(settings);
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (results, _) = broadcast::channel(RESULT_BROADCAST_CAPACITY);
        let worker = ClassifyWorker {
            settings: Arc::clone(&settings),
            repo,
            bus,
            notifier,
            results: results.clone(),
        };
        tokio::spawn(worker.run(rx));
        Self {
            tx,
            results,
            settings,
        }
    }

    /// Queue a classification. The receiver yields exactly one result, after
    /// the deploy triggered by the push has been correlated or timed out.
    #[tracing::instrument(skip(self, request), fields(node = %request.node))]
    pub async fn classify(&self, request: ClassifyRequest) -> oneshot::Receiver<NodeConfigResult> {
        let (sink, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(job)) = self.tx.send(Job { request, sink }).await {
            let node = job.request.node;
            let message = format!("Failed to classify {node}: {}", ClassifyError::QueueClosed);
            let _ = job.sink.send(NodeConfigResult::failed(&node, message));
        }
        rx
    }

    pub async fn get_classification(&self, node: &str, missing_ok: bool) -> Result<NodeConfig, ClassifyError> {
        node_config::load(&self.settings.nodes_dir, node, missing_ok).await
    }

    pub async fn get_environments(&self) -> EnvironmentsMsg {
        listing::environments(&self.settings.environment_path).await
    }

    pub async fn get_roles(&self, environment: &str) -> RolesMsg {
        listing::roles(&self.settings.environment_path, environment).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeConfigResult> {
        self.results.subscribe()
    }

    /// Requests waiting for the consumer.
    pub fn backlog_len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

impl ClassifyWorker {
    async fn run(self, mut rx: mpsc::Receiver<Job>) {
        while let Some(Job { request, sink }) = rx.recv().await {
            tracing::info!(node = %request.node, "processing classification");
            self.notifier
                .notify(&format!("Processing classification for {}", request.node));

            match self.stage(&request).await {
                Staged::Done(result) => {
                    self.notifier.notify(&result.message);
                    self.finish(sink, result);
                }
                Staged::Pushed(result, wait) => {
                    self.notifier.notify(&result.message);
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let result = worker.correlate(result, wait).await;
                        worker.finish(sink, result);
                    });
                }
            }
        }
        tracing::info!("classification queue stopped");
    }

    /// Everything that touches the working tree.
    async fn stage(&self, request: &ClassifyRequest) -> Staged {
        let node = request.node.as_str();
        let nodes_dir = &self.settings.nodes_dir;
        let fail = |message: String| Staged::Done(NodeConfigResult::failed(node, message));

        if let Err(e) = node_config::load(nodes_dir, node, request.missing_ok).await {
            return fail(format!("Failed to classify {node}: {e}"));
        }
        if let Err(e) = self.repo.pull().await {
            return fail(format!("Failed to pull changes: {e}"));
        }
        // The pull may have changed the file.
        let mut config = match node_config::load(nodes_dir, node, request.missing_ok).await {
            Ok(config) => config,
            Err(e) => return fail(format!("Failed to classify {node}: {e}")),
        };

        let changes = match config.apply(&request.environment, &request.primary_role) {
            Ok(changes) => changes,
            Err(e) => return fail(format!("Failed to classify {node}: {e}")),
        };
        if changes.is_empty() {
            let message = format!("Node '{node}' already classified as requested");
            tracing::info!(%node, "{message}");
            return Staged::Done(NodeConfigResult::succeeded(request, message));
        }

        let file = format!("{node}.yaml");
        let path = nodes_dir.join(&file);
        if let Err(e) = tokio::fs::write(&path, config.to_text()).await {
            self.reset().await;
            return fail(format!(
                "Failed to write config file {} for {node}: {e}",
                path.display()
            ));
        }
        if let Err(e) = self.repo.add(&file).await {
            self.reset().await;
            return fail(format!("Failed to git add {file}: {e}"));
        }
        let author = self.author(request);
        let commit = match self.repo.commit(&format!("Autoprovision {node}"), &author).await {
            Ok(commit) => commit,
            Err(e) => {
                self.reset().await;
                return fail(format!("Failed to commit {file}: {e}"));
            }
        };

        let message = format!(
            "Updated classification for '{node}': Changed {}",
            changes.join(" and ")
        );
        tracing::info!(%node, %commit, "{message}");

        // Registered before the push so a fast webhook still finds it.
        let wait = self.bus.watch_commit(&commit);
        if let Err(e) = self.repo.push().await {
            drop(wait);
            let note = format!("Failed to push changes for {node}: {e}");
            tracing::warn!(%node, %commit, "{note}");
            self.reset().await;
            return fail(format!("{message}. {note}"));
        }

        Staged::Pushed(NodeConfigResult::succeeded(request, message), wait)
    }

    fn author(&self, request: &ClassifyRequest) -> Author {
        let fallback = &self.settings.default_author;
        let pick = |given: &Option<String>, fallback: &str| {
            given
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(fallback)
                .to_owned()
        };
        Author {
            name: pick(&request.requestor_name, &fallback.name),
            email: pick(&request.requestor_email, &fallback.email),
        }
    }

    async fn reset(&self) {
        if let Err(e) = self.repo.reset_to_remote().await {
            tracing::error!(error = %e, "failed to reset nodes repository");
        }
    }

    /// Follow a pushed commit through its webhook and the deploy it started.
    async fn correlate(&self, mut result: NodeConfigResult, wait: CommitWait) -> NodeConfigResult {
        let node = result.node.clone();

        let Some((webhook, correlation)) = wait.wait(self.settings.webhook_timeout).await else {
            let note = format!("There was a timeout waiting for github webhook for node '{node}'");
            tracing::warn!(%node, "{note}");
            self.notifier.notify(&note);
            result.message = format!(
                "{}, but there was a timeout waiting for github webhook for node '{node}'",
                result.message
            );
            return result;
        };

        tracing::debug!(%node, correlation_id = %webhook.correlation_id, "webhook received, waiting for deploy");
        let deploy = correlation
            .watch_uuid(&webhook.correlation_id)
            .await
            .wait(self.settings.exec_timeout)
            .await;

        match deploy {
            None => {
                let note = format!("There was a timeout waiting for deploy script for node '{node}'");
                tracing::warn!(%node, "{note}");
                self.notifier.notify(&note);
                result.message = format!(
                    "{}, but there was a timeout waiting for deploy script for node '{node}'",
                    result.message
                );
            }
            Some(exec) if exec.exit_code != 0 => {
                let note = format!(
                    "There was a non-zero exit code during deploy for node '{node}': {}",
                    exec.message
                );
                tracing::warn!(%node, exit_code = exec.exit_code, "{note}");
                self.notifier.notify(&note);
                result.message = format!(
                    "{}, but there was a non-zero exit code during deploy: {}",
                    result.message, exec.message
                );
            }
            Some(exec) => {
                tracing::info!(%node, "{}", exec.message);
                result.message = format!("{}. {}", result.message, exec.message);
            }
        }
        result
    }

    fn finish(&self, sink: oneshot::Sender<NodeConfigResult>, result: NodeConfigResult) {
        tracing::info!(
            node = %result.node,
            success = result.success,
            message = %result.message,
            "classification finished"
        );
        let _ = self.results.send(result.clone());
        if sink.send(result).is_err() {
            tracing::debug!("classification result receiver gone");
        }
    }
}
