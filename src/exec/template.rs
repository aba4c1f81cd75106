use std::sync::{Arc, LazyLock};

use minijinja::{Environment, context};
use regex::Regex;

use super::error::ExecError;
use super::runner::CommandOutput;
use super::values::TemplateValues;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI escape regex")
});

/// Remove terminal colour and cursor sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn base_environment(values: &Arc<dyn TemplateValues>) -> Environment<'static> {
    let mut env = Environment::new();
    let values = Arc::clone(values);
    env.add_function("request", move |key: String| values.get(&key));
    env
}

/// Render argument templates. Only `request("key")` is available here.
pub fn render_args(
    templates: &[String],
    values: &Arc<dyn TemplateValues>,
) -> Result<Vec<String>, ExecError> {
    let env = base_environment(values);
    templates
        .iter()
        .map(|template| {
            env.render_str(template, context! {})
                .map_err(|e| ExecError::RenderFailed(format!("argument {template:?}: {e}")))
        })
        .collect()
}

/// Render a success or error message template against a finished command,
/// with `stdout()`, `stderr()` and `hostname()` in scope.
pub fn render_message(
    template: &str,
    values: &Arc<dyn TemplateValues>,
    output: &CommandOutput,
) -> Result<String, ExecError> {
    let mut env = base_environment(values);
    let stdout = output.stdout.clone();
    env.add_function("stdout", move || stdout.clone());
    let stderr = output.stderr.clone();
    env.add_function("stderr", move || stderr.clone());
    env.add_function("hostname", local_hostname);

    let rendered = env
        .render_str(template, context! {})
        .map_err(|e| ExecError::RenderFailed(e.to_string()))?;
    Ok(strip_ansi(&rendered))
}
