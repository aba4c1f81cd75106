use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::error::ClassifyError;

const REMOTE: &str = "origin";
const BRANCH: &str = "master";

/// Commit identity recorded on classification commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Default for Author {
    fn default() -> Self {
        Self {
            name: "Puppet Provisioner".into(),
            email: "provisioner@localhost".into(),
        }
    }
}

/// The git working tree holding node classifications.
///
/// Only the classification consumer calls these, one request at a time.
#[async_trait]
pub trait NodesRepository: Send + Sync {
    async fn pull(&self) -> Result<(), ClassifyError>;

    /// Stage `file`, relative to the work tree.
    async fn add(&self, file: &str) -> Result<(), ClassifyError>;

    /// Commit staged changes and return the new commit hash.
    async fn commit(&self, message: &str, author: &Author) -> Result<String, ClassifyError>;

    async fn push(&self) -> Result<(), ClassifyError>;

    /// Discard local commits and edits, back to the remote branch.
    async fn reset_to_remote(&self) -> Result<(), ClassifyError>;
}

/// `NodesRepository` over the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitCli {
    dir: PathBuf,
    ssh_command: Option<String>,
}

impl GitCli {
    /// Open `dir` as a work tree, authenticating to the remote with
    /// `private_key` when one is given.
    #[tracing::instrument(err)]
    pub async fn open(dir: &Path, private_key: Option<&Path>) -> Result<Self, ClassifyError> {
        let ssh_command = match private_key {
            Some(key) => {
                tokio::fs::metadata(key)
                    .await
                    .map_err(|e| ClassifyError::PrivateKey {
                        path: key.display().to_string(),
                        reason: e.to_string(),
                    })?;
                Some(format!(
                    "ssh -i {} -o IdentitiesOnly=yes -o BatchMode=yes",
                    key.display()
                ))
            }
            None => None,
        };

        let repo = Self {
            dir: dir.to_path_buf(),
            ssh_command,
        };
        let inside = repo
            .git("rev-parse", &["rev-parse", "--is-inside-work-tree"], None)
            .await
            .map_err(|e| ClassifyError::NotARepository {
                dir: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        if inside != "true" {
            return Err(ClassifyError::NotARepository {
                dir: dir.display().to_string(),
                reason: "not a work tree".into(),
            });
        }
        tracing::info!(dir = %dir.display(), keyed = repo.ssh_command.is_some(), "opened nodes repository");
        Ok(repo)
    }

    async fn git(
        &self,
        operation: &'static str,
        args: &[&str],
        author: Option<&Author>,
    ) -> Result<String, ClassifyError> {
        let mut cmd = tokio::process::Command::new("git");
        cmd.arg("-C").arg(&self.dir).args(args);
        cmd.stdin(std::process::Stdio::null());
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(ssh) = &self.ssh_command {
            cmd.env("GIT_SSH_COMMAND", ssh);
        }
        if let Some(author) = author {
            cmd.env("GIT_AUTHOR_NAME", &author.name)
                .env("GIT_AUTHOR_EMAIL", &author.email)
                .env("GIT_COMMITTER_NAME", &author.name)
                .env("GIT_COMMITTER_EMAIL", &author.email);
        }

        let output = cmd.output().await.map_err(|e| ClassifyError::Git {
            operation,
            detail: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let detail = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(ClassifyError::Git {
                operation,
                detail: detail.trim().to_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[async_trait]
impl NodesRepository for GitCli {
    async fn pull(&self) -> Result<(), ClassifyError> {
        self.git("pull", &["pull", "--ff-only", REMOTE, BRANCH], None)
            .await
            .map(drop)
    }

    async fn add(&self, file: &str) -> Result<(), ClassifyError> {
        self.git("add", &["add", "--", file], None).await.map(drop)
    }

    async fn commit(&self, message: &str, author: &Author) -> Result<String, ClassifyError> {
        self.git("commit", &["commit", "--quiet", "-m", message], Some(author))
            .await?;
        self.git("rev-parse", &["rev-parse", "HEAD"], None).await
    }

    async fn push(&self) -> Result<(), ClassifyError> {
        let refspec = format!("refs/heads/{BRANCH}:refs/heads/{BRANCH}");
        self.git("push", &["push", REMOTE, &refspec], None)
            .await
            .map(drop)
    }

    async fn reset_to_remote(&self) -> Result<(), ClassifyError> {
        let target = format!("{REMOTE}/{BRANCH}");
        self.git("reset", &["reset", "--hard", &target], None)
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sh(dir: &Path, args: &[&str]) {
        let status = tokio::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .status()
            .await
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    /// A bare origin with one commit on master, plus a clone of it.
    async fn origin_and_clone() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let origin = root.path().join("origin.git");
        let seed = root.path().join("seed");
        let work = root.path().join("work");
        std::fs::create_dir_all(&origin).unwrap();
        std::fs::create_dir_all(&seed).unwrap();

        sh(&origin, &["init", "--quiet", "--bare", "--initial-branch=master"]).await;
        sh(&seed, &["init", "--quiet", "--initial-branch=master"]).await;
        std::fs::write(seed.join("web01.yaml"), "environment: production\n").unwrap();
        sh(&seed, &["add", "web01.yaml"]).await;
        sh(&seed, &["commit", "--quiet", "-m", "seed"]).await;
        sh(&seed, &["push", "--quiet", origin.to_str().unwrap(), "master"]).await;

        let status = tokio::process::Command::new("git")
            .args(["clone", "--quiet", origin.to_str().unwrap(), work.to_str().unwrap()])
            .status()
            .await
            .unwrap();
        assert!(status.success());
        (root, origin, work)
    }

    #[tokio::test]
    async fn open_rejects_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitCli::open(dir.path(), None).await.unwrap_err();
        assert!(matches!(err, ClassifyError::NotARepository { .. }));
    }

    #[tokio::test]
    async fn open_rejects_missing_key() {
        let (_root, _origin, work) = origin_and_clone().await;
        let err = GitCli::open(&work, Some(Path::new("/nonexistent/id_rsa")))
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifyError::PrivateKey { .. }));
    }

    #[tokio::test]
    async fn commit_push_and_reset() {
        let (_root, origin, work) = origin_and_clone().await;
        let repo = GitCli::open(&work, None).await.unwrap();
        repo.pull().await.unwrap();

        std::fs::write(work.join("web01.yaml"), "environment: staging\n").unwrap();
        repo.add("web01.yaml").await.unwrap();
        let author = Author {
            name: "Jane Operator".into(),
            email: "jane@example.com".into(),
        };
        let hash = repo.commit("Autoprovision web01", &author).await.unwrap();
        assert_eq!(hash.len(), 40);
        repo.push().await.unwrap();

        let origin_head = tokio::process::Command::new("git")
            .arg("-C")
            .arg(&origin)
            .args(["log", "-1", "--format=%H %an <%ae> %s", "master"])
            .output()
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8_lossy(&origin_head.stdout).trim(),
            format!("{hash} Jane Operator <jane@example.com> Autoprovision web01")
        );

        std::fs::write(work.join("web01.yaml"), "garbage\n").unwrap();
        repo.reset_to_remote().await.unwrap();
        assert_eq!(
            std::fs::read_to_string(work.join("web01.yaml")).unwrap(),
            "environment: staging\n"
        );
    }

    #[tokio::test]
    async fn failed_command_reports_operation() {
        let (_root, _origin, work) = origin_and_clone().await;
        let repo = GitCli::open(&work, None).await.unwrap();
        let err = repo.add("missing.yaml").await.unwrap_err();
        assert!(matches!(err, ClassifyError::Git { operation: "add", .. }));
    }
}
