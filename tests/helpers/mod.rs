#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tower::ServiceExt;

use provisioner::api;
use provisioner::certsign::{SignerConfig, SigningQueue};
use provisioner::classify::{ClassificationOrchestrator, ClassifierSettings, GitCli};
use provisioner::config::Config;
use provisioner::events::EventBus;
use provisioner::exec::error::ExecError;
use provisioner::exec::{CommandOutput, CommandRunner, ExecDispatcher};
use provisioner::logbuf::LogBuffer;
use provisioner::notifications::Notifier;
use provisioner::state::AppState;

/// Records every command and answers per program, exit 0 by default.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    outputs: Mutex<HashMap<String, CommandOutput>>,
}

impl FakeRunner {
    pub fn respond(&self, program: &str, output: CommandOutput) {
        self.outputs.lock().unwrap().insert(program.to_owned(), output);
    }

    /// Program followed by its arguments, in call order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Poll until some call to `program` shows up.
    pub async fn wait_for(&self, program: &str) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(call) = self.calls().into_iter().find(|c| c[0] == program) {
                return call;
            }
            assert!(Instant::now() < deadline, "{program} was never run");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecError> {
        let call = std::iter::once(program.to_owned())
            .chain(args.iter().cloned())
            .collect();
        self.calls.lock().unwrap().push(call);
        Ok(self
            .outputs
            .lock()
            .unwrap()
            .get(program)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct TestEnv {
    pub app: Router,
    pub state: AppState,
    pub runner: Arc<FakeRunner>,
    pub notifications: mpsc::UnboundedReceiver<String>,
    pub dir: TempDir,
}

impl TestEnv {
    /// Notifications sent so far.
    pub fn drain_notifications(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = self.notifications.try_recv() {
            out.push(message);
        }
        out
    }

    pub fn environments_dir(&self) -> PathBuf {
        self.dir.path().join("environments")
    }
}

/// Service over a fresh temp directory. `{dir}` in `config_yaml` expands
/// to that directory.
pub async fn test_env(config_yaml: &str) -> TestEnv {
    test_env_in(tempfile::tempdir().unwrap(), config_yaml).await
}

/// Service over `dir`, which may already hold a nodes repository.
///
/// - Commands go to a `FakeRunner`, never to a real puppet
/// - Notifications are captured instead of posted
/// - Environments are read from `{dir}/environments`
pub async fn test_env_in(dir: TempDir, config_yaml: &str) -> TestEnv {
    let yaml = config_yaml.replace("{dir}", dir.path().to_str().unwrap());
    let config = Config::from_yaml(&yaml).expect("test config invalid");

    let ssl = dir.path().join("ssl");
    std::fs::create_dir_all(ssl.join("ca/requests")).unwrap();
    std::fs::create_dir_all(ssl.join("ca/signed")).unwrap();
    std::fs::create_dir_all(dir.path().join("environments")).unwrap();

    let runner = Arc::new(FakeRunner::default());
    let (notifier, notifications) = Notifier::channel();

    let exec = Arc::new(ExecDispatcher::start(
        config.all_exec_tasks(),
        runner.clone(),
        notifier.clone(),
        None,
    ));
    let bus = EventBus::start();
    bus.forward_exec_results(exec.subscribe());

    let signer = Arc::new(SigningQueue::start(
        SignerConfig {
            puppet_executable: config.puppet.executable.clone(),
            csr_dir: ssl.join("ca/requests"),
            signed_cert_dir: ssl.join("ca/signed"),
        },
        runner.clone(),
        notifier.clone(),
    ));

    let classifier = match &config.classification {
        Some(classification) => {
            let repo = GitCli::open(&classification.nodes_dir, None)
                .await
                .expect("nodes repository");
            let settings = ClassifierSettings {
                nodes_dir: classification.nodes_dir.clone(),
                environment_path: vec![dir.path().join("environments")],
                webhook_timeout: classification.webhook_timeout(),
                exec_timeout: classification.exec_timeout(),
                default_author: classification.default_author(),
            };
            Some(Arc::new(ClassificationOrchestrator::start(
                settings,
                Arc::new(repo),
                bus.clone(),
                notifier.clone(),
            )))
        }
        None => None,
    };

    let state = AppState {
        listeners: Arc::new(config.webhook_listeners()),
        config: Arc::new(config),
        signer,
        exec,
        classifier,
        bus,
        notifier,
        log: LogBuffer::new(16),
        started_at: Instant::now(),
    };

    TestEnv {
        app: api::app(state.clone()),
        state,
        runner,
        notifications,
        dir,
    }
}

// ---------------------------------------------------------------------------
// Nodes repository fixtures
// ---------------------------------------------------------------------------

pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = std::process::Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "seed")
        .env("GIT_AUTHOR_EMAIL", "seed@example.com")
        .env("GIT_COMMITTER_NAME", "seed")
        .env("GIT_COMMITTER_EMAIL", "seed@example.com")
        .output()
        .expect("git not runnable");
    assert!(output.status.success(), "git {args:?}: {}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8_lossy(&output.stdout).trim().to_owned()
}

/// `{dir}/origin.git` seeded with `files` on master, cloned to `{dir}/nodes`.
pub fn nodes_repo(dir: &Path, files: &[(&str, &str)]) -> (PathBuf, PathBuf) {
    let origin = dir.join("origin.git");
    let seed = dir.join("seed");
    let nodes = dir.join("nodes");
    std::fs::create_dir_all(&origin).unwrap();
    std::fs::create_dir_all(&seed).unwrap();

    git(&origin, &["init", "--quiet", "--bare", "--initial-branch=master"]);
    git(&seed, &["init", "--quiet", "--initial-branch=master"]);
    std::fs::write(seed.join("README"), "nodes\n").unwrap();
    for (name, content) in files {
        std::fs::write(seed.join(name), content).unwrap();
    }
    git(&seed, &["add", "."]);
    git(&seed, &["commit", "--quiet", "-m", "seed"]);
    git(&seed, &["push", "--quiet", origin.to_str().unwrap(), "master"]);
    git(dir, &["clone", "--quiet", origin.to_str().unwrap(), nodes.to_str().unwrap()]);
    (origin, nodes)
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

pub async fn get_json(app: &Router, path: &str) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn post_json(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

pub async fn post_form(app: &Router, path: &str, fields: &[(&str, &str)]) -> (StatusCode, Value) {
    let body = fields
        .iter()
        .map(|(k, v)| format!("{}={}", form_encode(k), form_encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    (status, body_json(resp).await)
}

/// POST a GitHub delivery. Returns the raw response text.
pub async fn post_webhook(
    app: &Router,
    event: Option<&str>,
    signature: Option<&str>,
    body: &str,
) -> (StatusCode, String) {
    let mut req = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("Content-Type", "application/json");
    if let Some(event) = event {
        req = req.header("X-GitHub-Event", event);
    }
    if let Some(signature) = signature {
        req = req.header("X-Hub-Signature-256", signature);
    }
    let resp = app
        .clone()
        .oneshot(req.body(Body::from(body.to_owned())).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

fn form_encode(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            b' ' => "+".to_owned(),
            _ => format!("%{b:02X}"),
        })
        .collect()
}

async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
}
