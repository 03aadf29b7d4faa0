use core::fmt;
use core::fmt::Display;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};
use std::process::Command as SyncCommand;
use std::sync::LazyLock;
use std::{io, process, str};

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::process::{CommandExt as _, OutputExt as _, SyncCommandExt as _};

// An ID for referring to a commit in a git repository. Having one doesn't
// guarantee the ID refers to an object in an actual repo, so error handling
// is still needed whenever you dereference it, like with any mutable
// database.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct CommitHash(String);

impl CommitHash {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn abbrev(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl AsRef<OsStr> for CommitHash {
    fn as_ref(&self) -> &OsStr {
        OsStr::from_bytes(self.0.as_bytes())
    }
}

impl AsRef<str> for CommitHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for CommitHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static COMMAND_SEM: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(64));

// Wrapper for a Command that holds a semaphore permit for as long as the
// process exists. This exists to try and avoid running into file descriptor
// exhaustion, without needing any retry logic that would risk creating
// livelocks.
#[derive(Debug)]
pub struct GitCommand {
    _permit: SemaphorePermit<'static>,
    command: Command,
}

impl GitCommand {
    fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut GitCommand {
        self.command.arg(arg);
        self
    }

    fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut GitCommand {
        self.command.args(args);
        self
    }

    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        self.command.execute().await
    }

    pub async fn output(&mut self) -> io::Result<process::Output> {
        self.command.output().await
    }
}

// A directory git commands can be run in. Might be a normal checkout, a bare
// cache repository or a worktree, the operations don't care.
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
    git_binary: PathBuf,
}

impl Repo {
    pub fn new(path: impl Into<PathBuf>, git_binary: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            git_binary: git_binary.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git_binary(&self) -> &Path {
        &self.git_binary
    }

    async fn git<I, S>(&self, args: I) -> GitCommand
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.git_binary);
        cmd.current_dir(&self.path);
        cmd.args(args);
        // Separate process group means the child doesn't get SIGINT if the
        // user Ctrl-C's the terminal. We are trusting that git won't get
        // stuck and prevent us from shutting down.
        cmd.process_group(0);
        GitCommand {
            _permit: COMMAND_SEM.acquire().await.unwrap(),
            command: cmd,
        }
    }

    // True iff path contains a git repository (of any shape).
    pub async fn is_repo(&self) -> bool {
        match self.git(["rev-parse", "--git-dir"]).await.output().await {
            Ok(output) => output.status.success(),
            Err(_) => false,
        }
    }

    // Initialise a bare repository at path, creating the directory if needed.
    pub async fn init_bare(
        path: impl Into<PathBuf>,
        git_binary: impl Into<PathBuf>,
    ) -> anyhow::Result<Repo> {
        let zelf = Repo::new(path, git_binary);
        tokio::fs::create_dir_all(&zelf.path)
            .await
            .with_context(|| format!("creating {:?}", zelf.path))?;
        zelf.git(["init", "--bare"])
            .await
            .execute()
            .await
            .context("'git init --bare' failed")?;
        Ok(zelf)
    }

    // Fetch a single ref from url; the result is available as FETCH_HEAD.
    pub async fn fetch(&self, url: &str, refspec: &str) -> anyhow::Result<()> {
        self.git(["fetch"])
            .await
            .args([url, refspec])
            .execute()
            .await
            .with_context(|| format!("fetching {refspec:?} from {url:?}"))?;
        Ok(())
    }

    // Stage and commit everything, tolerating a clean tree. Used to make
    // uncommitted changes in a submitter's repo visible to job worktrees.
    pub async fn commit_all(&self, message: &str) -> anyhow::Result<()> {
        self.git(["add", "-A"])
            .await
            .execute()
            .await
            .context("'git add -A' failed")?;
        let output = self
            .git(["commit", "--no-verify", "-m"])
            .await
            .arg(message)
            .output()
            .await
            .context("running 'git commit'")?;
        if output.code_not_killed()? != 0 {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stdout.contains("nothing to commit") {
                return Ok(());
            }
            bail!(
                "'git commit' failed: {}{}",
                stdout,
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }

    // None means we successfully looked it up but it didn't exist.
    pub async fn rev_parse(
        &self,
        rev_spec: impl AsRef<OsStr>,
    ) -> anyhow::Result<Option<CommitHash>> {
        let output = self
            .git(["rev-parse", "--verify", "--quiet"])
            .await
            .arg(rev_spec)
            .output()
            .await
            .context("failed to run 'git rev-parse'")?;
        if !output.status.success() {
            return Ok(None);
        }
        let out = str::from_utf8(&output.stdout).context("non utf-8 rev-parse output")?;
        Ok(Some(CommitHash::new(out.trim())))
    }

    // Create a detached worktree for one job. The dir should be empty.
    pub async fn worktree_add(
        &self,
        dir: TempDir,
        rev: impl AsRef<OsStr>,
    ) -> anyhow::Result<JobWorktree> {
        // Create the guard before the worktree actually exists so the removal
        // behaviour kicks in even if we fail or get cancelled half way.
        let zelf = JobWorktree {
            origin: self.clone(),
            dir,
            cleaned_up: false,
        };
        self.git(["worktree", "add", "--detach"])
            .await
            .arg(zelf.dir.path())
            .arg(rev.as_ref())
            .execute()
            .await
            .context("'git worktree add' failed")?;
        Ok(zelf)
    }
}

// A worktree checked out for the duration of one job, removed on all exit
// paths. Call cleanup() when done; if you forget, drop removes it
// synchronously (blocking the async runtime) and you will feel like a dumb
// idiot and your friends will laugh at you.
#[derive(Debug)]
pub struct JobWorktree {
    origin: Repo,
    dir: TempDir,
    cleaned_up: bool,
}

impl JobWorktree {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cleanup_cmd(&self) -> Option<SyncCommand> {
        if !self.origin.path().exists() {
            debug!(
                "Not de-registering worktree at {:?} as origin repo ({:?}) is gone.",
                self.dir.path(),
                self.origin.path()
            );
            return None;
        }
        let mut cmd = SyncCommand::new(self.origin.git_binary());
        // Double --force means remove it even if we were in the middle of
        // creating it.
        cmd.args(["worktree", "remove", "--force", "--force"])
            .arg(self.dir.path())
            .current_dir(self.origin.path());
        Some(cmd)
    }

    pub async fn cleanup(mut self) {
        if let Some(cmd) = self.cleanup_cmd() {
            match Command::from(cmd).execute().await {
                // Normal when the constructor failed before the worktree
                // was registered.
                Err(e) => debug!("Couldn't clean up worktree {:?}: {:?}", self.dir.path(), e),
                Ok(_) => debug!("Removed worktree at {:?}", self.dir.path()),
            }
        }
        self.cleaned_up = true;
    }
}

impl Drop for JobWorktree {
    fn drop(&mut self) {
        if self.cleaned_up {
            return;
        }
        warn!(
            "JobWorktree was not cleaned up before drop. \
                This is functionally harmless but probably slows things down."
        );
        if let Some(mut cmd) = self.cleanup_cmd() {
            let _ = cmd.execute();
        }
    }
}
