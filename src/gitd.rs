use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::process::{ChildExt as _, CommandExt as _};

pub const DEFAULT_PORT: u16 = 9418;
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

// Child process exposing the coordinator's repository read-only over the
// git:// protocol, so workers can fetch the commits they're asked to build.
#[derive(Debug)]
pub struct GitDaemon {
    child: Child,
    port: u16,
}

impl GitDaemon {
    pub async fn start(
        repo_dir: impl Into<PathBuf>,
        port: u16,
        listen_addr: Option<&str>,
    ) -> anyhow::Result<Self> {
        let repo_dir = repo_dir.into();
        ensure_export_ok(&repo_dir)
            .await
            .context("marking repository exportable")?;

        let mut base_path = std::ffi::OsString::from("--base-path=");
        base_path.push(&repo_dir);
        let mut cmd = Command::new("git");
        cmd.arg("daemon")
            .arg("--reuseaddr")
            .arg(format!("--port={port}"))
            .arg(base_path)
            .arg("--export-all");
        if let Some(addr) = listen_addr {
            cmd.arg(format!("--listen={addr}"));
        }
        cmd.arg(&repo_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = cmd.spawn().context("spawning git daemon")?;

        // A daemon that can't bind its port exits immediately; catch that
        // here rather than having every later fetch fail mysteriously.
        tokio::time::sleep(Duration::from_millis(100)).await;
        if child.try_wait().context("checking git daemon")?.is_some() {
            let output = child
                .wait_with_output()
                .await
                .context("collecting git daemon output")?;
            bail!(
                "git daemon exited on startup: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!("git daemon serving {repo_dir:?} on port {port}");
        Ok(Self { child, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    // SIGTERM, a grace period, then SIGKILL.
    pub async fn stop(mut self) {
        if let Err(e) = self.child.signal(Signal::SIGTERM) {
            debug!("Couldn't SIGTERM git daemon: {e:#}");
        }
        match timeout(STOP_GRACE_PERIOD, self.child.wait()).await {
            Ok(_) => debug!("git daemon stopped"),
            Err(_) => {
                warn!("git daemon ignored SIGTERM, killing it");
                let _ = self.child.kill().await;
            }
        }
    }
}

// git daemon refuses to serve repositories that aren't explicitly marked
// exportable. --export-all covers it too, but the marker survives the
// daemon being restarted with different flags. It goes in the git dir,
// wherever that is.
async fn ensure_export_ok(repo_dir: &Path) -> anyhow::Result<()> {
    let output = Command::new("git")
        .args(["rev-parse", "--absolute-git-dir"])
        .current_dir(repo_dir)
        .execute()
        .await
        .with_context(|| format!("{repo_dir:?} doesn't look like a git repository"))?;
    let git_dir = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
    let marker = git_dir.join("git-daemon-export-ok");
    if !marker.exists() {
        tokio::fs::write(&marker, b"")
            .await
            .with_context(|| format!("creating {marker:?}"))?;
    }
    Ok(())
}
