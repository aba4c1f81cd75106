use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::classify::Author;
use crate::exec::ExecTaskConfig;
use crate::notifications::NotificationConfig;

const R10K_TASK_NAME: &str = "R10k sync";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Recent log lines kept in memory for `GET /log`.
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,
    #[serde(default)]
    pub puppet: PuppetSettings,
    #[serde(default)]
    pub exec_tasks: Vec<ExecTaskConfig>,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub classification: Option<ClassificationConfig>,
    #[serde(default)]
    pub notifications: Vec<NotificationConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PuppetSettings {
    #[serde(default = "default_puppet_executable")]
    pub executable: String,
    #[serde(default = "default_puppet_conf_dir")]
    pub conf_dir: PathBuf,
}

impl Default for PuppetSettings {
    fn default() -> Self {
        Self {
            executable: default_puppet_executable(),
            conf_dir: default_puppet_conf_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhooksConfig {
    /// Shared secret for `X-Hub-Signature-256`; unsigned requests are
    /// accepted when unset.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub enable_standard_r10k_listener: bool,
    #[serde(default = "default_r10k_executable")]
    pub r10k_executable: String,
    #[serde(default)]
    pub listeners: Vec<ExecListener>,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            secret: None,
            enable_standard_r10k_listener: false,
            r10k_executable: default_r10k_executable(),
            listeners: Vec::new(),
        }
    }
}

/// Runs `exec_task` for every GitHub event of type `event`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecListener {
    pub event: String,
    pub exec_task: ExecTaskConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationConfig {
    pub nodes_dir: PathBuf,
    /// SSH key for the nodes repository remote.
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,
    #[serde(default = "default_exec_timeout_secs")]
    pub exec_timeout_secs: u64,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

impl ClassificationConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    /// Identity for commits whose requestor gave none.
    pub fn default_author(&self) -> Author {
        let fallback = Author::default();
        Author {
            name: self.author_name.clone().unwrap_or(fallback.name),
            email: self.author_email.clone().unwrap_or(fallback.email),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8240".into()
}

fn default_log_buffer_lines() -> usize {
    500
}

fn default_puppet_executable() -> String {
    "/opt/puppetlabs/bin/puppet".into()
}

fn default_puppet_conf_dir() -> PathBuf {
    PathBuf::from("/etc/puppetlabs/puppet")
}

fn default_r10k_executable() -> String {
    "/opt/puppetlabs/puppet/bin/r10k".into()
}

fn default_webhook_timeout_secs() -> u64 {
    120
}

fn default_exec_timeout_secs() -> u64 {
    600
}

impl Config {
    /// Read and validate the YAML file at `path`. `PROVISIONER_LISTEN`
    /// overrides the listen address.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&text)?;
        if let Ok(listen) = env::var("PROVISIONER_LISTEN") {
            config.listen = listen;
        }
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for task in self.all_exec_tasks() {
            if task.name.trim().is_empty() {
                return Err(ConfigError::Invalid("exec task with an empty name".into()));
            }
            if task.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "exec task {:?} has no command",
                    task.name
                )));
            }
            if !names.insert(task.name.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "exec task name {:?} is used more than once",
                    task.name
                )));
            }
        }
        if let Some(listener) = self.webhooks.listeners.iter().find(|l| l.event.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "webhook listener for {:?} has no event",
                listener.exec_task.name
            )));
        }
        if let Some(classification) = &self.classification {
            if classification.nodes_dir.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("classification.nodes_dir is required".into()));
            }
            if classification.webhook_timeout_secs == 0 || classification.exec_timeout_secs == 0 {
                return Err(ConfigError::Invalid(
                    "classification timeouts must be at least one second".into(),
                ));
            }
        }
        Ok(())
    }

    /// Configured listeners plus the standard r10k one when enabled.
    pub fn webhook_listeners(&self) -> Vec<ExecListener> {
        let mut listeners = self.webhooks.listeners.clone();
        if self.webhooks.enable_standard_r10k_listener {
            listeners.push(ExecListener {
                event: "push".into(),
                exec_task: ExecTaskConfig {
                    name: R10K_TASK_NAME.into(),
                    command: self.webhooks.r10k_executable.clone(),
                    args: vec!["deploy".into(), "environment".into(), "--puppetfile".into()],
                    success_message: "r10k deployed environments".into(),
                    error_message: "r10k deploy failed: {{ stderr() }}".into(),
                    reentrant: false,
                },
            });
        }
        listeners
    }

    /// Every exec task the dispatcher must know about: standalone tasks and
    /// those run by webhook listeners.
    pub fn all_exec_tasks(&self) -> Vec<ExecTaskConfig> {
        self.exec_tasks
            .iter()
            .cloned()
            .chain(self.webhook_listeners().into_iter().map(|l| l.exec_task))
            .collect()
    }
}
