//! Classification against a real git remote, with the deploy correlated
//! through the webhook endpoint.

mod helpers;

use std::path::Path;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use provisioner::exec::CommandOutput;
use serde_json::{Value, json};

use helpers::{TestEnv, git, nodes_repo, post_json, post_webhook, test_env_in};

const WEB01: &str = "\
# managed by the provisioner
environment: production   # default
parameters:
  primary_role: role::web
  ntp_servers:
    - pool.ntp.org
";

async fn setup(webhook_timeout_secs: u64) -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    nodes_repo(dir.path(), &[("web01.yaml", WEB01)]);
    test_env_in(
        dir,
        &format!(
            r#"
webhooks:
  enable_standard_r10k_listener: true
  r10k_executable: r10k
classification:
  nodes_dir: "{{dir}}/nodes"
  webhook_timeout_secs: {webhook_timeout_secs}
  exec_timeout_secs: 5
  author_name: Provisioner Bot
  author_email: bot@example.com
"#
        ),
    )
    .await
}

/// Wait for origin's master to move off `from`.
async fn pushed_commit(origin: &Path, from: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let head = git(origin, &["rev-parse", "master"]);
        if head != from {
            return head;
        }
        assert!(Instant::now() < deadline, "classification was never pushed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn classify(env: &TestEnv, node: &str, body: Value) -> tokio::task::JoinHandle<(StatusCode, Value)> {
    let app = env.app.clone();
    let path = format!("/api/nodes/{node}/classification");
    tokio::spawn(async move { post_json(&app, &path, body).await })
}

fn push_payload(commit: &str) -> String {
    json!({
        "ref": "refs/heads/master",
        "commits": [
            {"id": "0000000000000000000000000000000000000001"},
            {"id": commit}
        ]
    })
    .to_string()
}

#[tokio::test]
async fn classification_waits_for_deploy_of_its_commit() {
    let env = setup(10).await;
    let origin = env.dir.path().join("origin.git");
    let seed_head = git(&origin, &["rev-parse", "master"]);

    let pending = classify(
        &env,
        "web01",
        json!({
            "environment": "staging",
            "primary_role": "role::db",
            "requestor_name": "Jane Operator",
            "requestor_email": "jane@example.com"
        }),
    );

    let commit = pushed_commit(&origin, &seed_head).await;
    let (status, body) = post_webhook(&env.app, Some("push"), None, &push_payload(&commit)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1 listeners matched.");

    let (status, result) = pending.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true, "{result}");
    assert_eq!(
        result["message"],
        "Updated classification for 'web01': Changed environment from 'production' to 'staging' \
         and primary_role from 'role::web' to 'role::db'. r10k deployed environments"
    );
    assert_eq!(result["environment"], "staging");
    assert_eq!(result["primary_role"], "role::db");

    // Only the two values changed; comments and other parameters survive.
    let pushed = git(&origin, &["show", "master:web01.yaml"]);
    assert_eq!(
        pushed,
        "# managed by the provisioner\n\
         environment: staging   # default\n\
         parameters:\n  primary_role: role::db\n  ntp_servers:\n    - pool.ntp.org"
    );
    assert_eq!(
        git(&origin, &["log", "-1", "--format=%an <%ae>|%s", "master"]),
        "Jane Operator <jane@example.com>|Autoprovision web01"
    );

    let snapshot = env.state.bus.snapshot();
    assert_eq!(snapshot.commit_watches, 0);
    assert_eq!(snapshot.uuid_watches, 0);
    assert_eq!(snapshot.outstanding_watches, 0);
}

#[tokio::test]
async fn failed_deploy_is_reported_with_its_message() {
    let env = setup(10).await;
    env.runner.respond(
        "r10k",
        CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "module not found".into(),
        },
    );
    let origin = env.dir.path().join("origin.git");
    let seed_head = git(&origin, &["rev-parse", "master"]);

    let pending = classify(&env, "db01", json!({"environment": "production", "missing_ok": true}));
    let commit = pushed_commit(&origin, &seed_head).await;
    post_webhook(&env.app, Some("push"), None, &push_payload(&commit)).await;

    let (_, result) = pending.await.unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(
        result["message"],
        "Updated classification for 'db01': Changed environment from '' to 'production', \
         but there was a non-zero exit code during deploy: r10k deploy failed: module not found"
    );
    assert_eq!(git(&origin, &["show", "master:db01.yaml"]), "environment: production");
}

#[tokio::test]
async fn webhook_for_other_commits_times_out() {
    let env = setup(1).await;
    let origin = env.dir.path().join("origin.git");
    let seed_head = git(&origin, &["rev-parse", "master"]);

    let pending = classify(&env, "web01", json!({"environment": "staging", "primary_role": "role::web"}));
    pushed_commit(&origin, &seed_head).await;
    post_webhook(&env.app, Some("push"), None, &push_payload(&seed_head)).await;

    let (_, result) = pending.await.unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(
        result["message"],
        "Updated classification for 'web01': Changed environment from 'production' to 'staging', \
         but there was a timeout waiting for github webhook for node 'web01'"
    );
    assert_eq!(env.state.bus.snapshot().outstanding_watches, 0);
}

#[tokio::test]
async fn pull_picks_up_remote_changes_first() {
    let env = setup(1).await;
    let origin = env.dir.path().join("origin.git");

    // Someone else reclassifies web01 upstream.
    let other = env.dir.path().join("other");
    git(env.dir.path(), &["clone", "--quiet", origin.to_str().unwrap(), other.to_str().unwrap()]);
    std::fs::write(
        other.join("web01.yaml"),
        "environment: staging\nparameters:\n  primary_role: role::web\n",
    )
    .unwrap();
    git(&other, &["commit", "--quiet", "-am", "upstream"]);
    git(&other, &["push", "--quiet", "origin", "master"]);
    let upstream_head = git(&origin, &["rev-parse", "master"]);

    let (status, result) = post_json(
        &env.app,
        "/api/nodes/web01/classification",
        json!({"environment": "staging", "primary_role": "role::web"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["message"], "Node 'web01' already classified as requested");
    assert_eq!(git(&origin, &["rev-parse", "master"]), upstream_head);
}
