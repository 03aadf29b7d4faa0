use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use directories::ProjectDirs;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tempfile::{Builder as TempDirBuilder, TempDir};
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::git::{JobWorktree, Repo};
use crate::process::ChildExt as _;
use crate::proto::{Job, Stream};
use crate::result::{JobResult, EXIT_CANCELLED, EXIT_EXEC_FAILED};

// Called with each captured line (newline included) as it arrives.
pub type OutputCallback = Arc<dyn Fn(Stream, &str) + Send + Sync>;

#[derive(Debug, PartialEq, Eq)]
pub enum ExecOutcome {
    // Non-zero exit codes land here too, they are data, not errors.
    Completed { exit_code: i32 },
    Cancelled,
    /// Never produced an exit code: bad worktree, spawn failure, timeout.
    Failed { message: String },
}

#[derive(Debug)]
pub struct Execution {
    pub outcome: ExecOutcome,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl Execution {
    fn failed(message: String, duration: Duration) -> Self {
        Self {
            outcome: ExecOutcome::Failed { message },
            stdout: String::new(),
            stderr: String::new(),
            duration,
        }
    }

    // Flatten into the caller-facing result shape. Failure messages are
    // folded into both stderr and output so every verbosity level keeps
    // them.
    pub fn into_result(self, job_id: &str) -> JobResult {
        let duration_secs = self.duration.as_secs_f64();
        match self.outcome {
            ExecOutcome::Completed { exit_code } => JobResult {
                job_id: job_id.to_owned(),
                exit_code,
                output: format!("{}{}", self.stdout, self.stderr),
                stdout: self.stdout,
                stderr: self.stderr,
                duration_secs,
            },
            ExecOutcome::Cancelled => JobResult {
                duration_secs,
                ..JobResult::cancelled(job_id)
            },
            ExecOutcome::Failed { message } => {
                let stderr = format!("{}{}\n", self.stderr, message);
                JobResult {
                    job_id: job_id.to_owned(),
                    exit_code: EXIT_EXEC_FAILED,
                    output: format!("{}{}", self.stdout, stderr),
                    stdout: self.stdout,
                    stderr,
                    duration_secs,
                }
            }
        }
    }

    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            ExecOutcome::Completed { exit_code } => *exit_code,
            ExecOutcome::Cancelled => EXIT_CANCELLED,
            ExecOutcome::Failed { .. } => EXIT_EXEC_FAILED,
        }
    }
}

// Where a job gets to run. Removed on all exit paths, best effort.
enum Workdir {
    // No repo requested, just an ephemeral directory.
    Temp(TempDir),
    Worktree(JobWorktree),
}

impl Workdir {
    fn path(&self) -> &std::path::Path {
        match self {
            Self::Temp(dir) => dir.path(),
            Self::Worktree(worktree) => worktree.path(),
        }
    }

    async fn cleanup(self) {
        match self {
            // TempDir removes itself on drop.
            Self::Temp(_) => {}
            Self::Worktree(worktree) => worktree.cleanup().await,
        }
    }
}

// Runs one job in an isolated worktree and reports what happened.
pub struct Executor {
    worktree_dir: PathBuf,
    git_cache_dir: Option<PathBuf>,
    use_nix_shell: bool,
    git_binary: PathBuf,
}

impl Executor {
    pub fn new(
        worktree_dir: impl Into<PathBuf>,
        git_cache_dir: Option<PathBuf>,
        use_nix_shell: bool,
    ) -> Self {
        Self {
            worktree_dir: worktree_dir.into(),
            git_cache_dir,
            use_nix_shell,
            git_binary: PathBuf::from("git"),
        }
    }

    pub async fn run(
        &self,
        job: &Job,
        ct: &CancellationToken,
        on_output: Option<OutputCallback>,
    ) -> Execution {
        let start = Instant::now();
        let workdir = match self.materialise(job).await {
            Ok(workdir) => workdir,
            Err(e) => {
                return Execution::failed(
                    format!("setting up worktree: {e:#}"),
                    start.elapsed(),
                )
            }
        };
        let execution = self.execute(job, workdir.path(), ct, on_output, start).await;
        workdir.cleanup().await;
        execution
    }

    // Produce the directory the job's command runs in, per the three repo
    // modes: none at all, a remote URL (fetched via a shared bare cache) or
    // a local path (with uncommitted changes captured first).
    async fn materialise(&self, job: &Job) -> anyhow::Result<Workdir> {
        tokio::fs::create_dir_all(&self.worktree_dir)
            .await
            .with_context(|| format!("creating worktree root {:?}", self.worktree_dir))?;
        // Unique per-job path even when a job id gets reused.
        let dir = TempDirBuilder::new()
            .prefix(&format!("job-{}-", job.job_id))
            .tempdir_in(&self.worktree_dir)
            .context("creating job directory")?;

        if job.repo.is_empty() {
            return Ok(Workdir::Temp(dir));
        }

        if is_remote_url(&job.repo) {
            let cache = self.open_cache_repo().await?;
            let refspec = if job.commit.is_empty() {
                "HEAD"
            } else {
                &job.commit
            };
            cache.fetch(&job.repo, refspec).await?;
            let worktree = cache
                .worktree_add(dir, "FETCH_HEAD")
                .await
                .context("creating worktree from FETCH_HEAD")?;
            return Ok(Workdir::Worktree(worktree));
        }

        let source = Repo::new(&job.repo, &self.git_binary);
        if !source.is_repo().await {
            bail!("{:?} is not a git repository", job.repo);
        }
        // Jobs should see what the submitter sees, including work they
        // haven't committed yet.
        source
            .commit_all("Auto-commit uncommitted changes before job")
            .await?;
        let rev = if job.commit.is_empty() {
            "HEAD"
        } else {
            &job.commit
        };
        let worktree = source.worktree_add(dir, rev).await?;
        Ok(Workdir::Worktree(worktree))
    }

    // The bare repository remote fetches go through. First writable
    // location wins: the configured path, the user cache dir, the OS temp
    // dir.
    async fn open_cache_repo(&self) -> anyhow::Result<Repo> {
        let mut candidates = Vec::new();
        if let Some(dir) = &self.git_cache_dir {
            candidates.push(dir.clone());
        }
        if let Some(dirs) = ProjectDirs::from("", "", "drover") {
            candidates.push(dirs.cache_dir().join("repo-cache.git"));
        }
        candidates.push(std::env::temp_dir().join("drover-repo-cache.git"));

        for path in candidates {
            let repo = Repo::new(&path, &self.git_binary);
            if repo.is_repo().await {
                return Ok(repo);
            }
            match Repo::init_bare(&path, &self.git_binary).await {
                Ok(repo) => return Ok(repo),
                Err(e) => debug!("Cache candidate {path:?} unusable: {e:#}"),
            }
        }
        bail!("no writable location for the git cache repository")
    }

    async fn execute(
        &self,
        job: &Job,
        workdir: &std::path::Path,
        ct: &CancellationToken,
        on_output: Option<OutputCallback>,
        start: Instant,
    ) -> Execution {
        let mut cmd = if self.use_nix_shell {
            let mut cmd = Command::new("nix");
            cmd.args(["develop", "--command", "sh", "-c", &job.command]);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", &job.command]);
            cmd
        };
        cmd.current_dir(workdir)
            .envs(&job.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so we can kill the whole job, including
            // whatever the shell spawned.
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Execution::failed(format!("spawning job command: {e}"), start.elapsed())
            }
        };

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        // The pipes are there because we asked for them just above.
        let stdout_pipe = child.stdout.take().expect("no stdout pipe");
        let stderr_pipe = child.stderr.take().expect("no stderr pipe");
        let stdout_pump = tokio::spawn(pump(
            stdout_pipe,
            Stream::Stdout,
            stdout_buf.clone(),
            on_output.clone(),
        ));
        let stderr_pump = tokio::spawn(pump(
            stderr_pipe,
            Stream::Stderr,
            stderr_buf.clone(),
            on_output,
        ));

        enum WaitOutcome {
            Exited(std::io::Result<std::process::ExitStatus>),
            Cancelled,
            TimedOut,
        }
        let wait_outcome = select! {
            status = child.wait() => WaitOutcome::Exited(status),
            _ = ct.cancelled() => WaitOutcome::Cancelled,
            _ = sleep(job.timeout()) => WaitOutcome::TimedOut,
        };

        if !matches!(wait_outcome, WaitOutcome::Exited(_)) {
            if let Err(e) = child.signal_group(Signal::SIGKILL) {
                debug!("Couldn't kill job {:?}: {e:#}", job.job_id);
            }
            let _ = child.wait().await;
        }
        // Both pumps must drain before the result is assembled, otherwise we
        // could drop a tail of output that the process wrote before exiting.
        let _ = stdout_pump.await;
        let _ = stderr_pump.await;

        let duration = start.elapsed();
        let stdout = std::mem::take(&mut *stdout_buf.lock());
        let stderr = std::mem::take(&mut *stderr_buf.lock());
        let outcome = match wait_outcome {
            WaitOutcome::Cancelled => ExecOutcome::Cancelled,
            WaitOutcome::TimedOut => ExecOutcome::Failed {
                message: format!("timed out after {}s", job.timeout().as_secs()),
            },
            WaitOutcome::Exited(Err(e)) => ExecOutcome::Failed {
                message: format!("waiting for job command: {e}"),
            },
            WaitOutcome::Exited(Ok(status)) => match status.code() {
                Some(exit_code) => ExecOutcome::Completed { exit_code },
                None => ExecOutcome::Failed {
                    message: format!("job command killed by signal ({status:?})"),
                },
            },
        };
        Execution {
            outcome,
            stdout,
            stderr,
            duration,
        }
    }
}

fn is_remote_url(repo: &str) -> bool {
    repo.starts_with("git://") || repo.starts_with("http://") || repo.starts_with("https://")
}

// Read one stream line-oriented, newline preserved, appending to buf and
// forwarding to the callback.
async fn pump(
    reader: impl AsyncRead + Unpin,
    stream: Stream,
    buf: Arc<Mutex<String>>,
    on_output: Option<OutputCallback>,
) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                buf.lock().push_str(&text);
                if let Some(cb) = &on_output {
                    cb(stream, &text);
                }
            }
            Err(e) => {
                debug!("error reading job {stream:?}: {e}");
                return;
            }
        }
    }
}
