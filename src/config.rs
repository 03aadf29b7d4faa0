use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context as _};
use clap::Args;
#[allow(unused_imports)]
use log::debug;
use serde::Deserialize;

use crate::logbuf::DEFAULT_RETENTION_CAPACITY;
use crate::result::Verbosity;
use crate::{gitd, worker};

// The TOML config file. Everything is optional; CLI flags override file
// values only when explicitly present, file values override the built-in
// defaults.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub worker: WorkerSection,
    /// Multi-orchestrator mode: the agent holds a session to every listed
    /// server, all backed by one slot pool.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read config {path:?}"))?;
        toml::from_str(&content).with_context(|| format!("couldn't parse config {path:?}"))
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorSection {
    pub listen_addr: Option<String>,
    pub port: Option<u16>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub retention_capacity: Option<usize>,
    pub verbosity: Option<Verbosity>,
    pub embedded_fallback: Option<bool>,
    pub repo: Option<PathBuf>,
    pub git_daemon: Option<bool>,
    pub git_daemon_port: Option<u16>,
    pub git_daemon_listen: Option<String>,
    // For the embedded fallback executor.
    pub worktree_dir: Option<PathBuf>,
    pub git_cache_dir: Option<PathBuf>,
    pub use_nix_shell: Option<bool>,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    pub id: Option<String>,
    pub jobs: Option<u32>,
    pub server: Option<String>,
    pub git_cache_dir: Option<PathBuf>,
    pub worktree_dir: Option<PathBuf>,
    pub use_nix_shell: Option<bool>,
    /// Nix installables to build at startup so the first job doesn't pay
    /// for them. Only meaningful with use_nix_shell.
    #[serde(default)]
    pub prewarm: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServerEntry {
    pub url: String,
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Port for the HTTP/WebSocket endpoint.
    #[arg(long)]
    pub port: Option<u16>,
    /// Repository to expose to workers via the git daemon.
    #[arg(long)]
    pub repo: Option<PathBuf>,
    /// Don't spawn a git daemon for the repository.
    #[arg(long)]
    pub no_git_daemon: bool,
    /// Don't fall back to in-process execution when no workers are
    /// connected.
    #[arg(long)]
    pub no_embedded: bool,
}

#[derive(Args, Debug, Default)]
pub struct WorkArgs {
    /// Coordinator WebSocket URL, e.g. ws://host:8080/ws.
    #[arg(long)]
    pub server: Option<String>,
    /// Name to register under. Defaults to <hostname>-<pid>.
    #[arg(long)]
    pub id: Option<String>,
    /// Number of jobs to run concurrently.
    #[arg(long)]
    pub jobs: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub listen_addr: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub retention_capacity: usize,
    pub verbosity: Verbosity,
    pub embedded_fallback: bool,
    pub repo: PathBuf,
    pub git_daemon: bool,
    pub git_daemon_port: u16,
    pub git_daemon_listen: Option<String>,
    pub worktree_dir: PathBuf,
    pub git_cache_dir: Option<PathBuf>,
    pub use_nix_shell: bool,
}

impl CoordinatorConfig {
    pub fn resolve(file: &CoordinatorSection, args: &ServeArgs) -> anyhow::Result<Self> {
        let config = Self {
            listen_addr: file
                .listen_addr
                .clone()
                .unwrap_or_else(|| "0.0.0.0".to_owned()),
            port: args.port.or(file.port).unwrap_or(8080),
            heartbeat_interval: Duration::from_secs(file.heartbeat_interval_secs.unwrap_or(30)),
            heartbeat_timeout: Duration::from_secs(file.heartbeat_timeout_secs.unwrap_or(90)),
            retention_capacity: file
                .retention_capacity
                .unwrap_or(DEFAULT_RETENTION_CAPACITY),
            verbosity: file.verbosity.unwrap_or_default(),
            embedded_fallback: !args.no_embedded && file.embedded_fallback.unwrap_or(true),
            repo: args
                .repo
                .clone()
                .or_else(|| file.repo.clone())
                .unwrap_or_else(|| PathBuf::from(".")),
            git_daemon: !args.no_git_daemon && file.git_daemon.unwrap_or(true),
            git_daemon_port: file.git_daemon_port.unwrap_or(gitd::DEFAULT_PORT),
            git_daemon_listen: file.git_daemon_listen.clone(),
            worktree_dir: file
                .worktree_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("drover-worktrees")),
            git_cache_dir: file.git_cache_dir.clone(),
            use_nix_shell: file.use_nix_shell.unwrap_or(false),
        };
        if config.heartbeat_timeout <= config.heartbeat_interval {
            bail!(
                "heartbeat_timeout_secs ({:?}) must exceed heartbeat_interval_secs ({:?})",
                config.heartbeat_timeout,
                config.heartbeat_interval
            );
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: String,
    pub max_jobs: u32,
    pub servers: Vec<String>,
    pub git_cache_dir: Option<PathBuf>,
    pub worktree_dir: PathBuf,
    pub use_nix_shell: bool,
    pub prewarm: Vec<String>,
}

impl WorkerConfig {
    pub fn resolve(file: &ConfigFile, args: &WorkArgs) -> anyhow::Result<Self> {
        let mut servers = Vec::new();
        if let Some(server) = args.server.clone().or_else(|| file.worker.server.clone()) {
            servers.push(server);
        }
        for entry in &file.servers {
            if !servers.contains(&entry.url) {
                servers.push(entry.url.clone());
            }
        }
        if servers.is_empty() {
            bail!("no coordinator configured: pass --server or add [[servers]] to the config");
        }

        let max_jobs = args
            .jobs
            .or(file.worker.jobs)
            .unwrap_or(worker::DEFAULT_JOBS);
        if max_jobs == 0 {
            bail!("--jobs must be at least 1");
        }

        Ok(Self {
            id: args
                .id
                .clone()
                .or_else(|| file.worker.id.clone())
                .unwrap_or_else(default_worker_id),
            max_jobs,
            servers,
            git_cache_dir: file.worker.git_cache_dir.clone(),
            worktree_dir: file
                .worker
                .worktree_dir
                .clone()
                .unwrap_or_else(|| std::env::temp_dir().join("drover-worktrees")),
            use_nix_shell: file.worker.use_nix_shell.unwrap_or(false),
            prewarm: file.worker.prewarm.clone(),
        })
    }
}

fn default_worker_id() -> String {
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "worker".to_owned());
    format!("{hostname}-{}", std::process::id())
}
