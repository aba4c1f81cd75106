use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::exec::runner::CommandRunner;

static VERSION_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").expect("valid version regex"));

static SETTING_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-zA-Z_0-9]+)\s=\s(.*)$").expect("valid setting regex")
});

#[derive(Debug, thiserror::Error)]
pub enum PuppetError {
    #[error("failed to run {program}: {reason}")]
    CommandFailed { program: String, reason: String },

    #[error("failed to determine puppet version from {0:?}")]
    UnknownVersion(String),

    #[error("puppet config print did not report {0}")]
    MissingSetting(&'static str),
}

/// Locations and executables discovered from the local puppet installation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PuppetConfig {
    pub executable: String,
    pub version: String,
    pub conf_file: PathBuf,
    pub conf_dir: PathBuf,
    pub ssl_dir: PathBuf,
    pub csr_dir: PathBuf,
    pub signed_cert_dir: PathBuf,
    pub environment_path: Vec<PathBuf>,
}

impl PuppetConfig {
    /// Ask the puppet CLI for its version and for the `main` then `server`
    /// sections of its configuration, later sections taking precedence.
    #[tracing::instrument(skip(runner), err)]
    pub async fn discover(
        runner: &dyn CommandRunner,
        executable: &str,
        conf_dir: &Path,
    ) -> Result<Self, PuppetError> {
        let version_out = runner
            .run(executable, &["--version".to_owned()])
            .await
            .map_err(|e| PuppetError::CommandFailed {
                program: executable.to_owned(),
                reason: e.to_string(),
            })?;
        let version = version_out.stdout.lines().next().unwrap_or("").trim();
        if !VERSION_LINE.is_match(version) {
            return Err(PuppetError::UnknownVersion(version_out.stdout.clone()));
        }
        tracing::info!(version, "found puppet");

        let mut config = Self {
            executable: executable.to_owned(),
            version: version.to_owned(),
            ..Self::default()
        };

        for section in ["main", "server"] {
            let args = [
                "config".to_owned(),
                "print".to_owned(),
                "--confdir".to_owned(),
                conf_dir.display().to_string(),
                "--section".to_owned(),
                section.to_owned(),
            ];
            let out = runner
                .run(executable, &args)
                .await
                .map_err(|e| PuppetError::CommandFailed {
                    program: executable.to_owned(),
                    reason: e.to_string(),
                })?;
            if out.exit_code != 0 {
                tracing::warn!(section, stderr = %out.stderr, "puppet config print exited non-zero");
            }
            config.apply_settings(&out.stdout);
        }

        config.validate()?;
        tracing::info!(
            csr_dir = %config.csr_dir.display(),
            signed_cert_dir = %config.signed_cert_dir.display(),
            "puppet configuration loaded"
        );
        Ok(config)
    }

    fn apply_settings(&mut self, output: &str) {
        for line in output.lines() {
            let Some(caps) = SETTING_LINE.captures(line) else {
                continue;
            };
            let value = caps[2].trim();
            match &caps[1] {
                "ssldir" => self.ssl_dir = PathBuf::from(value),
                "csrdir" => self.csr_dir = PathBuf::from(value),
                "signeddir" => self.signed_cert_dir = PathBuf::from(value),
                "config" => self.conf_file = PathBuf::from(value),
                "confdir" => self.conf_dir = PathBuf::from(value),
                "environmentpath" => {
                    self.environment_path = value
                        .split(':')
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect();
                }
                _ => {}
            }
        }
    }

    fn validate(&self) -> Result<(), PuppetError> {
        let required = [
            ("ssldir", &self.ssl_dir),
            ("csrdir", &self.csr_dir),
            ("signeddir", &self.signed_cert_dir),
            ("config", &self.conf_file),
            ("confdir", &self.conf_dir),
        ];
        for (name, value) in required {
            if value.as_os_str().is_empty() {
                return Err(PuppetError::MissingSetting(name));
            }
        }
        if self.environment_path.is_empty() {
            return Err(PuppetError::MissingSetting("environmentpath"));
        }
        Ok(())
    }

    /// Rewrite a `puppet` exec command to the discovered executable. The
    /// config file and confdir flags go after the subcommand so a non-root
    /// CLI acts on the server's file locations.
    pub fn rewrite_command(&self, command: &str, args: Vec<String>) -> (String, Vec<String>) {
        if command != "puppet" {
            return (command.to_owned(), args);
        }
        let mut rest = args.into_iter();
        let mut rewritten: Vec<String> = rest.next().into_iter().collect();
        rewritten.extend([
            "--config".to_owned(),
            self.conf_file.display().to_string(),
            "--confdir".to_owned(),
            self.conf_dir.display().to_string(),
        ]);
        rewritten.extend(rest);
        (self.executable.clone(), rewritten)
    }
}
