use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use provisioner::api;
use provisioner::certsign::{SignerConfig, SigningQueue};
use provisioner::classify::{ClassificationOrchestrator, ClassifierSettings, GitCli};
use provisioner::config::Config;
use provisioner::events::EventBus;
use provisioner::exec::{CommandRunner, ExecDispatcher, SystemRunner};
use provisioner::logbuf::LogBuffer;
use provisioner::notifications::Notifier;
use provisioner::puppet::PuppetConfig;
use provisioner::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "provisioner", version, about = "Puppet certificate signing and node classification service")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(
        long,
        env = "PROVISIONER_CONFIG",
        default_value = "/etc/provisioner/provisioner.yaml"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let log = LogBuffer::new(cfg.log_buffer_lines);
    init_tracing(cfg.log_file.as_deref(), log.clone())?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let puppet = PuppetConfig::discover(runner.as_ref(), &cfg.puppet.executable, &cfg.puppet.conf_dir)
        .await
        .context("invalid puppet installation, cannot proceed")?;

    let notifier = Notifier::from_config(&cfg.notifications);

    let exec = Arc::new(ExecDispatcher::start(
        cfg.all_exec_tasks(),
        Arc::clone(&runner),
        notifier.clone(),
        Some(puppet.clone()),
    ));
    let bus = EventBus::start();
    bus.forward_exec_results(exec.subscribe());

    let signer = Arc::new(SigningQueue::start(
        SignerConfig {
            puppet_executable: puppet.executable.clone(),
            csr_dir: puppet.csr_dir.clone(),
            signed_cert_dir: puppet.signed_cert_dir.clone(),
        },
        Arc::clone(&runner),
        notifier.clone(),
    ));

    let classifier = match &cfg.classification {
        Some(classification) => {
            let repo = GitCli::open(&classification.nodes_dir, classification.private_key.as_deref())
                .await
                .context("nodes repository unusable, cannot proceed")?;
            let settings = ClassifierSettings {
                nodes_dir: classification.nodes_dir.clone(),
                environment_path: puppet.environment_path.clone(),
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
        None => {
            tracing::info!("node classification not configured");
            None
        }
    };

    let state = AppState {
        listeners: Arc::new(cfg.webhook_listeners()),
        config: Arc::new(cfg.clone()),
        signer: Arc::clone(&signer),
        exec,
        classifier,
        bus,
        notifier,
        log,
        started_at: Instant::now(),
    };
    let app = api::app(state);

    let addr: SocketAddr = cfg.listen.parse().context("invalid listen address")?;
    tracing::info!(%addr, puppet_version = %puppet.version, "starting provisioner");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("HTTP server stopped");

    signer.shutdown().await;
    tracing::info!("certificate signing stopped, exiting");
    Ok(())
}

/// JSON logs to stdout, or appended to `log_file` when configured. Either
/// way the newest lines are also kept in `tail`.
fn init_tracing(log_file: Option<&Path>, tail: LogBuffer) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("PROVISIONER_LOG").unwrap_or_else(|_| "info".into());
    let (stdout, file) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("unable to open log file {}", path.display()))?;
            (None, Some(fmt::layer().json().with_writer(Mutex::new(file))))
        }
        None => (Some(fmt::layer().json()), None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .with(fmt::layer().json().with_ansi(false).with_writer(tail))
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
