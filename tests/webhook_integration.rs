mod helpers;

use axum::http::StatusCode;
use provisioner::api::webhook::signature;

use helpers::{post_webhook, test_env};

const PUSH: &str = r#"{
  "ref": "refs/heads/production",
  "commits": [{"id": "1111111111111111111111111111111111111111"}]
}"#;

const SIGNED: &str = r#"
webhooks:
  secret: s3cret
  listeners:
    - event: push
      exec_task:
        name: sync
        command: sync-code
        args: ['{{ request("$.ref") }}']
"#;

const R10K: &str = r#"
webhooks:
  enable_standard_r10k_listener: true
  r10k_executable: r10k
"#;

#[tokio::test]
async fn event_header_is_required() {
    let env = test_env(R10K).await;
    let (status, body) = post_webhook(&env.app, None, None, PUSH).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body.contains("X-GitHub-Event"));
}

#[tokio::test]
async fn unsigned_delivery_is_unauthorized() {
    let env = test_env(SIGNED).await;
    let (status, _) = post_webhook(&env.app, Some("push"), None, PUSH).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(env.runner.calls().is_empty());
}

#[tokio::test]
async fn wrong_signature_is_forbidden() {
    let env = test_env(SIGNED).await;
    let sig = signature("not-the-secret", PUSH.as_bytes()).unwrap();
    let (status, _) = post_webhook(&env.app, Some("push"), Some(&sig), PUSH).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn signed_delivery_runs_listener_with_payload_values() {
    let env = test_env(SIGNED).await;
    let sig = signature("s3cret", PUSH.as_bytes()).unwrap();
    let (status, body) = post_webhook(&env.app, Some("push"), Some(&sig), PUSH).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1 listeners matched.");

    let call = env.runner.wait_for("sync-code").await;
    assert_eq!(call, vec!["sync-code", "refs/heads/production"]);
}

#[tokio::test]
async fn other_events_match_nothing() {
    let env = test_env(SIGNED).await;
    let payload = r#"{"zen": "Design for failure."}"#;
    let sig = signature("s3cret", payload.as_bytes()).unwrap();
    let (status, body) = post_webhook(&env.app, Some("ping"), Some(&sig), payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "0 listeners matched.");
}

#[tokio::test]
async fn invalid_json_is_rejected() {
    let env = test_env(R10K).await;
    let (status, _) = post_webhook(&env.app, Some("push"), None, "{not json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn standard_r10k_listener_deploys_on_push() {
    let mut env = test_env(R10K).await;
    let (status, body) = post_webhook(&env.app, Some("push"), None, PUSH).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "1 listeners matched.");

    let call = env.runner.wait_for("r10k").await;
    assert_eq!(call, vec!["r10k", "deploy", "environment", "--puppetfile"]);

    // The success message is sent once the command finishes.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if env
            .drain_notifications()
            .iter()
            .any(|n| n == "r10k deployed environments")
        {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no deploy notification");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
