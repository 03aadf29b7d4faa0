use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use drover::config::{ConfigFile, CoordinatorConfig, ServeArgs, WorkArgs, WorkerConfig};
use drover::coordinator::Coordinator;
use drover::gitd::GitDaemon;
use drover::worker::Agent;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level (RUST_LOG-style env spec still wins).
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator: accept jobs over HTTP, hand them to workers.
    Serve(ServeArgs),
    /// Run a worker agent against one or more coordinators.
    Work(WorkArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _logger = flexi_logger::Logger::try_with_env_or_str(if cli.debug {
        "debug"
    } else {
        "info"
    })
    .context("bad log spec")?
    .start()
    .context("couldn't start logger")?;

    let file = match &cli.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };

    let ct = CancellationToken::new();
    tokio::spawn({
        let ct = ct.clone();
        async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    error!("Couldn't install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!("Couldn't wait for ctrl-C: {e}");
                        return;
                    }
                }
                _ = sigterm.recv() => {}
            }
            info!("Shutting down");
            ct.cancel();
        }
    });

    match cli.command {
        Command::Serve(args) => serve(&file, &args, ct).await,
        Command::Work(args) => {
            let config = WorkerConfig::resolve(&file, &args)?;
            info!(
                "Worker {:?} starting with {} slots",
                config.id, config.max_jobs
            );
            Agent::new(config).run(ct).await
        }
    }
}

async fn serve(file: &ConfigFile, args: &ServeArgs, ct: CancellationToken) -> anyhow::Result<()> {
    let config = CoordinatorConfig::resolve(&file.coordinator, args)?;

    let git_daemon = if config.git_daemon {
        Some(
            GitDaemon::start(
                &config.repo,
                config.git_daemon_port,
                config.git_daemon_listen.as_deref(),
            )
            .await
            .context("starting git daemon")?,
        )
    } else {
        None
    };

    let listener = TcpListener::bind((config.listen_addr.as_str(), config.port))
        .await
        .with_context(|| format!("binding {}:{}", config.listen_addr, config.port))?;
    info!(
        "Coordinator listening on {}",
        listener.local_addr().context("no local addr")?
    );

    let result = Coordinator::new(config).serve(listener, ct).await;

    if let Some(daemon) = git_daemon {
        daemon.stop().await;
    }
    result
}
