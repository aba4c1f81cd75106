use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::error::ExecError;
use super::runner::{CommandOutput, CommandRunner};
use super::template::{render_args, render_message, strip_ansi};
use super::values::TemplateValues;
use crate::notifications::Notifier;
use crate::puppet::PuppetConfig;

/// Pending runs buffered per command before `run` waits for room.
const QUEUE_DEPTH: usize = 50;
const RESULT_BROADCAST_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecTaskConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub success_message: String,
    #[serde(default)]
    pub error_message: String,
    /// Reentrant tasks run immediately; others share one FIFO per command.
    #[serde(default)]
    pub reentrant: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub task_name: String,
    pub correlation_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub message: String,
}

struct QueuedRun {
    task: Arc<ExecTaskConfig>,
    args: Vec<String>,
    values: Arc<dyn TemplateValues>,
    correlation_id: String,
    reply: oneshot::Sender<ExecResult>,
}

struct ExecContext {
    runner: Arc<dyn CommandRunner>,
    notifier: Notifier,
    results: broadcast::Sender<ExecResult>,
    puppet: Option<PuppetConfig>,
}

/// Routes named task invocations either straight to a task of their own or
/// onto the serializing queue of the command they invoke.
pub struct ExecDispatcher {
    tasks: HashMap<String, Arc<ExecTaskConfig>>,
    queues: HashMap<String, mpsc::Sender<QueuedRun>>,
    ctx: Arc<ExecContext>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

impl ExecDispatcher {
    /// Build the dispatcher and spawn one consumer for every distinct command
    /// used by a non-reentrant task. Must be called within a tokio runtime.
    pub fn start(
        tasks: impl IntoIterator<Item = ExecTaskConfig>,
        runner: Arc<dyn CommandRunner>,
        notifier: Notifier,
        puppet: Option<PuppetConfig>,
    ) -> Self {
        let (results, _) = broadcast::channel(RESULT_BROADCAST_CAPACITY);
        let ctx = Arc::new(ExecContext {
            runner,
            notifier,
            results,
            puppet,
        });

        let mut by_name = HashMap::new();
        let mut queues = HashMap::new();
        for task in tasks {
            if !task.reentrant && !queues.contains_key(&task.command) {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                tokio::spawn(consume(task.command.clone(), rx, Arc::clone(&ctx)));
                queues.insert(task.command.clone(), tx);
            }
            by_name.insert(task.name.clone(), Arc::new(task));
        }

        tracing::info!(
            tasks = by_name.len(),
            serialized_commands = queues.len(),
            "exec dispatcher started"
        );
        Self {
            tasks: by_name,
            queues,
            ctx,
        }
    }

    pub fn is_configured(&self, task_name: &str) -> bool {
        self.tasks.contains_key(task_name)
    }

    /// Every finished run, whoever requested it.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecResult> {
        self.ctx.results.subscribe()
    }

    /// Submit a run. The receiver yields exactly one result; a render failure
    /// resolves it immediately without running anything.
    #[tracing::instrument(skip(self, values), fields(task = %task_name), err)]
    pub async fn run(
        &self,
        task_name: &str,
        values: Arc<dyn TemplateValues>,
        correlation_id: &str,
    ) -> Result<oneshot::Receiver<ExecResult>, ExecError> {
        let task = self
            .tasks
            .get(task_name)
            .cloned()
            .ok_or_else(|| ExecError::UnknownTask(task_name.to_owned()))?;
        let (reply, rx) = oneshot::channel();

        let args = match render_args(&task.args, &values) {
            Ok(args) => args,
            Err(e) => {
                tracing::error!(error = %e, task = %task.name, "could not prepare command");
                let output = CommandOutput::failed(e.to_string());
                let result = ExecResult {
                    task_name: task.name.clone(),
                    correlation_id: correlation_id.to_owned(),
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    message: String::new(),
                };
                self.ctx.publish(result, reply);
                return Ok(rx);
            }
        };

        let job = QueuedRun {
            task: Arc::clone(&task),
            args,
            values,
            correlation_id: correlation_id.to_owned(),
            reply,
        };

        if task.reentrant {
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move { ctx.execute(job).await });
        } else {
            let queue = self
                .queues
                .get(&task.command)
                .ok_or_else(|| ExecError::QueueClosed(task.command.clone()))?;
            queue
                .send(job)
                .await
                .map_err(|_| ExecError::QueueClosed(task.command.clone()))?;
        }
        Ok(rx)
    }
}

async fn consume(command: String, mut rx: mpsc::Receiver<QueuedRun>, ctx: Arc<ExecContext>) {
    tracing::debug!(%command, "exec queue consumer started");
    while let Some(job) = rx.recv().await {
        ctx.execute(job).await;
    }
    tracing::debug!(%command, "exec queue consumer stopped");
}

impl ExecContext {
    async fn execute(&self, job: QueuedRun) {
        let (program, args) = match &self.puppet {
            Some(puppet) => puppet.rewrite_command(&job.task.command, job.args),
            None => (job.task.command.clone(), job.args),
        };
        let command_line = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let output = match self.runner.run(&program, &args).await {
            Ok(output) => output,
            Err(e) => CommandOutput::failed(e.to_string()),
        };

        let (template, kind) = if output.succeeded() {
            (&job.task.success_message, "success")
        } else {
            (&job.task.error_message, "error")
        };
        let message = if template.is_empty() {
            String::new()
        } else {
            match render_message(template, &job.values, &output) {
                Ok(message) => message,
                Err(e) => strip_ansi(&format!(
                    "Command \"{command_line}\" exited {}. An error occurred processing the {kind} message template: {e}",
                    output.exit_code
                )),
            }
        };

        let stdout = strip_ansi(&output.stdout);
        let stderr = strip_ansi(&output.stderr);
        if output.succeeded() {
            tracing::info!(
                task = %job.task.name,
                command = %command_line,
                exit_code = output.exit_code,
                %stdout,
                %stderr,
                notification = %message,
                "command finished"
            );
        } else {
            tracing::warn!(
                task = %job.task.name,
                command = %command_line,
                exit_code = output.exit_code,
                %stdout,
                %stderr,
                notification = %message,
                "command failed"
            );
        }

        if !message.is_empty() {
            self.notifier.notify(&message);
        }

        let result = ExecResult {
            task_name: job.task.name.clone(),
            correlation_id: job.correlation_id,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            message,
        };
        self.publish(result, job.reply);
    }

    fn publish(&self, result: ExecResult, reply: oneshot::Sender<ExecResult>) {
        // No subscribers is fine; nobody is correlating right now.
        let _ = self.results.send(result.clone());
        let _ = reply.send(result);
    }
}
