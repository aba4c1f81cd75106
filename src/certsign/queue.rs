use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::watcher::{self, CsrEvents};
use crate::exec::{CommandOutput, CommandRunner};
use crate::notifications::Notifier;

const QUEUE_DEPTH: usize = 100;
const RESULT_BROADCAST_CAPACITY: usize = 64;

/// Puppet CA phrases meaning the CSR has not been submitted yet.
const NO_CSR_MARKERS: [&str; 2] = ["could not find certificate request", "could not find csr"];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerConfig {
    pub puppet_executable: String,
    pub csr_dir: PathBuf,
    pub signed_cert_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SigningAction {
    Sign,
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningResult {
    pub subject: String,
    pub action: SigningAction,
    pub success: bool,
    pub message: String,
}

type ResultSink = mpsc::Sender<SigningResult>;

pub(super) enum SigningRequest {
    Sign {
        subject: String,
        clean_existing: bool,
        sink: ResultSink,
    },
    Clean {
        subject: String,
        sink: ResultSink,
    },
    /// From the CSR watcher; acted on only for subjects someone asked to sign.
    CsrArrived { subject: String },
}

/// Front door of the signing queue. All CA work happens on one consumer task.
pub struct SigningQueue {
    tx: ArcSwapOption<mpsc::Sender<SigningRequest>>,
    results: broadcast::Sender<SigningResult>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Consumer state. `authorized` maps each subject awaiting a signature to
/// the callers waiting on it and is never reachable from outside the task.
struct SigningWorker {
    config: SignerConfig,
    runner: Arc<dyn CommandRunner>,
    notifier: Notifier,
    results: broadcast::Sender<SigningResult>,
    authorized: HashMap<String, Vec<ResultSink>>,
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

impl SigningQueue {
    /// Start the consumer and a filesystem watch on the CSR directory. A
    /// watch failure is logged; signing then completes only for CSRs already
    /// present when asked.
    pub fn start(config: SignerConfig, runner: Arc<dyn CommandRunner>, notifier: Notifier) -> Self {
        let csr_dir = config.csr_dir.clone();
        let (queue, tx) = Self::launch(config, runner, notifier);
        if let Err(e) = watcher::watch_dir(&csr_dir, tx, queue.cancel.child_token()) {
            tracing::error!(error = %e, "CSR auto-signing disabled");
        }
        queue
    }

    /// Start the consumer fed by an existing CSR event stream.
    pub fn start_with_events(
        config: SignerConfig,
        runner: Arc<dyn CommandRunner>,
        notifier: Notifier,
        events: CsrEvents,
    ) -> Self {
        let (queue, tx) = Self::launch(config, runner, notifier);
        watcher::watch_events(events, tx, queue.cancel.child_token());
        queue
    }

    fn launch(
        config: SignerConfig,
        runner: Arc<dyn CommandRunner>,
        notifier: Notifier,
    ) -> (Self, mpsc::Sender<SigningRequest>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (results, _) = broadcast::channel(RESULT_BROADCAST_CAPACITY);
        let worker = SigningWorker {
            config,
            runner,
            notifier,
            results: results.clone(),
            authorized: HashMap::new(),
        };
        let handle = tokio::spawn(worker.run(rx));

        let queue = Self {
            tx: ArcSwapOption::from_pointee(tx.clone()),
            results,
            cancel: CancellationToken::new(),
            worker: Mutex::new(Some(handle)),
        };
        (queue, tx)
    }

    /// Queue a signing. Yields the revoke result first when `clean_existing`,
    /// then the sign result, which may wait for the CSR to arrive.
    #[tracing::instrument(skip(self))]
    pub async fn sign(&self, subject: &str, clean_existing: bool) -> mpsc::Receiver<SigningResult> {
        let (sink, rx) = mpsc::channel(2);
        if let Err(reason) = validate_subject(subject) {
            send_now(&sink, failure(subject, SigningAction::Sign, reason));
            return rx;
        }
        let request = SigningRequest::Sign {
            subject: subject.to_owned(),
            clean_existing,
            sink: sink.clone(),
        };
        if !self.enqueue(request).await {
            send_now(&sink, stopped(subject, SigningAction::Sign));
        }
        rx
    }

    /// Queue a revocation. Yields one result.
    #[tracing::instrument(skip(self))]
    pub async fn clean(&self, subject: &str) -> mpsc::Receiver<SigningResult> {
        let (sink, rx) = mpsc::channel(1);
        if let Err(reason) = validate_subject(subject) {
            send_now(&sink, failure(subject, SigningAction::Revoke, reason));
            return rx;
        }
        let request = SigningRequest::Clean {
            subject: subject.to_owned(),
            sink: sink.clone(),
        };
        if !self.enqueue(request).await {
            send_now(&sink, stopped(subject, SigningAction::Revoke));
        }
        rx
    }

    async fn enqueue(&self, request: SigningRequest) -> bool {
        let Some(tx) = self.tx.load_full() else {
            return false;
        };
        tx.send(request).await.is_ok()
    }

    /// Requests waiting for the consumer.
    pub fn backlog_len(&self) -> usize {
        self.tx
            .load_full()
            .map_or(0, |tx| tx.max_capacity() - tx.capacity())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SigningResult> {
        self.results.subscribe()
    }

    /// Refuse new requests, stop the CSR watch and wait for the consumer to
    /// finish what is already queued.
    pub async fn shutdown(&self) {
        self.tx.store(None);
        self.cancel.cancel();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::error!(error = %e, "signing consumer ended abnormally");
        }
    }
}

fn validate_subject(subject: &str) -> Result<(), String> {
    if subject.is_empty()
        || subject.starts_with('-')
        || subject.contains(['/', '\\'])
        || subject.contains("..")
        || subject.chars().any(char::is_whitespace)
    {
        return Err(format!("\"{subject}\" is not a valid certificate name."));
    }
    Ok(())
}

fn failure(subject: &str, action: SigningAction, message: String) -> SigningResult {
    SigningResult {
        subject: subject.to_owned(),
        action,
        success: false,
        message,
    }
}

fn stopped(subject: &str, action: SigningAction) -> SigningResult {
    failure(
        subject,
        action,
        format!("Certificate signing is shut down; request for {subject} rejected."),
    )
}

fn send_now(sink: &ResultSink, result: SigningResult) {
    if sink.try_send(result).is_err() {
        tracing::debug!("signing result receiver gone");
    }
}

fn no_csr_present(output: &CommandOutput) -> bool {
    let text = output.combined().to_lowercase();
    NO_CSR_MARKERS.iter().any(|marker| text.contains(marker))
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

impl SigningWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<SigningRequest>) {
        tracing::info!("certificate signing queue started");
        while let Some(request) = rx.recv().await {
            self.process(request).await;
        }
        tracing::info!(
            waiting = self.authorized.len(),
            "certificate signing queue drained"
        );
    }

    async fn process(&mut self, request: SigningRequest) {
        match request {
            SigningRequest::Sign {
                subject,
                clean_existing,
                sink,
            } => {
                if clean_existing {
                    // A failed revoke is reported but does not stop the sign.
                    let result = self.revoke(&subject).await;
                    self.publish(&result);
                    send_now(&sink, result);
                }
                self.authorized.entry(subject.clone()).or_default().push(sink);
                self.sign(&subject).await;
            }
            SigningRequest::Clean { subject, sink } => {
                let result = self.revoke(&subject).await;
                self.publish(&result);
                send_now(&sink, result);
            }
            SigningRequest::CsrArrived { subject } => {
                if self.authorized.contains_key(&subject) {
                    tracing::info!(%subject, "CSR arrived for pending signing");
                    self.sign(&subject).await;
                } else {
                    tracing::debug!(%subject, "ignoring CSR nobody asked to sign");
                }
            }
        }
    }

    async fn run_ca(&self, verb: &str, subject: &str) -> CommandOutput {
        let args = ["cert".to_owned(), verb.to_owned(), subject.to_owned()];
        match self.runner.run(&self.config.puppet_executable, &args).await {
            Ok(output) => output,
            Err(e) => CommandOutput::failed(e.to_string()),
        }
    }

    async fn sign(&mut self, subject: &str) {
        let output = self.run_ca("sign", subject).await;

        let result = if output.succeeded() {
            let message = format!("Certificate for \"{subject}\" has been signed.");
            tracing::info!(%subject, "{message}");
            SigningResult {
                subject: subject.to_owned(),
                action: SigningAction::Sign,
                success: true,
                message,
            }
        } else if no_csr_present(&output) {
            tracing::info!(%subject, "no CSR yet, signing deferred until it arrives");
            self.notifier.notify(&format!("Waiting for CSR from {subject}..."));
            return;
        } else {
            let message = format!(
                "Signing certificate for \"{subject}\" failed: {}",
                output.combined()
            );
            tracing::warn!(%subject, exit_code = output.exit_code, "{message}");
            failure(subject, SigningAction::Sign, message)
        };

        self.notifier.notify(&result.message);
        self.publish(&result);
        for sink in self.authorized.remove(subject).unwrap_or_default() {
            send_now(&sink, result.clone());
        }
    }

    async fn revoke(&self, subject: &str) -> SigningResult {
        let cert = self.config.signed_cert_dir.join(format!("{subject}.pem"));
        let exists = match tokio::fs::try_exists(&cert).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::warn!(error = %e, path = %cert.display(), "could not check for signed certificate");
                false
            }
        };
        if !exists {
            return SigningResult {
                subject: subject.to_owned(),
                action: SigningAction::Revoke,
                success: true,
                message: format!("No existing certificate for {subject} to revoke."),
            };
        }

        let output = self.run_ca("clean", subject).await;
        let result = if output.succeeded() {
            SigningResult {
                subject: subject.to_owned(),
                action: SigningAction::Revoke,
                success: true,
                message: format!("Certificate for \"{subject}\" has been revoked."),
            }
        } else {
            failure(
                subject,
                SigningAction::Revoke,
                format!(
                    "Revoking certificate for \"{subject}\" failed: {}",
                    output.combined()
                ),
            )
        };
        tracing::info!(%subject, success = result.success, "{}", result.message);
        self.notifier.notify(&result.message);
        result
    }

    fn publish(&self, result: &SigningResult) {
        let _ = self.results.send(result.clone());
    }
}
