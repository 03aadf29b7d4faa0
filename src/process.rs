use std::process::Output;

use anyhow::{bail, Context as _};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

pub trait OutputExt {
    // The exit code, unless the process was killed by a signal.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
    // Error unless the process exited 0, with stderr folded into the message.
    fn ok(self) -> anyhow::Result<Output>;
}

impl OutputExt for Output {
    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .with_context(|| format!("process killed by signal ({:?})", self.status))
    }

    fn ok(self) -> anyhow::Result<Output> {
        let code = self.code_not_killed()?;
        if code != 0 {
            bail!(
                "failed with exit code {}. stderr:\n{}",
                code,
                String::from_utf8_lossy(&self.stderr)
            );
        }
        Ok(self)
    }
}

pub trait CommandExt {
    // Run to completion capturing output, failing on spawn errors and
    // non-zero exit codes. For commands whose exit code is interesting, use
    // output() and inspect it yourself.
    async fn execute(&mut self) -> anyhow::Result<Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .await
            .with_context(|| format!("spawning {:?}", self.as_std().get_program()))?;
        output.ok()
    }
}

pub trait SyncCommandExt {
    fn execute(&mut self) -> anyhow::Result<Output>;
}

impl SyncCommandExt for std::process::Command {
    fn execute(&mut self) -> anyhow::Result<Output> {
        let output = self
            .output()
            .with_context(|| format!("spawning {:?}", self.get_program()))?;
        output.ok()
    }
}

pub trait ChildExt {
    // Rust only gives us SIGKILL, this is for everything else.
    fn signal(&self, signal: Signal) -> anyhow::Result<()>;
    // Signal the child's whole process group (requires the child to have
    // been spawned with process_group(0)).
    fn signal_group(&self, signal: Signal) -> anyhow::Result<()>;
}

impl ChildExt for Child {
    fn signal(&self, signal: Signal) -> anyhow::Result<()> {
        let pid: i32 = self
            .id()
            .context("no PID for child")?
            .try_into()
            .context("PID out of range")?;
        kill(Pid::from_raw(pid), signal).context("couldn't signal child")
    }

    fn signal_group(&self, signal: Signal) -> anyhow::Result<()> {
        let pid: i32 = self
            .id()
            .context("no PID for child")?
            .try_into()
            .context("PID out of range")?;
        kill(Pid::from_raw(-pid), signal).context("couldn't signal process group")
    }
}
