use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use futures::{SinkExt as _, StreamExt as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::executor::{ExecOutcome, Executor, OutputCallback};
use crate::pool::Pool;
use crate::process::CommandExt as _;
use crate::proto::Frame;
use crate::result::EXIT_CANCELLED;
use crate::util::{ErrGroup, ResultExt as _};

pub const DEFAULT_JOBS: u32 = 4;

const WRITE_DEADLINE: Duration = Duration::from_secs(10);
// How long a coordinator may stay silent before we give up on the
// connection. The coordinator pings every 30s by default, so this tolerates
// two lost pings.
const SERVER_TIMEOUT: Duration = Duration::from_secs(90);

// Reconnect delay: 1s, 2s, 4s, ... capped at 60s. Reset on a successful
// connect.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt.min(6)).min(60))
}

// Outboxes of the currently connected sessions, so a slot freed by a job
// finishing on one server becomes visible to all of them.
#[derive(Default)]
struct Sessions {
    outboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl Sessions {
    fn insert(&self, server: &str, outbox: mpsc::UnboundedSender<Message>) {
        self.outboxes.lock().insert(server.to_owned(), outbox);
    }

    fn remove(&self, server: &str) {
        self.outboxes.lock().remove(server);
    }

    fn broadcast_ready(&self, slots: u32) {
        for outbox in self.outboxes.lock().values() {
            // A dead session is mid-cleanup, it doesn't need the update.
            let _ = outbox.send(Message::Text(Frame::Ready { slots }.encode()));
        }
    }
}

// The worker agent: one slot pool and one executor backing a session to
// every configured coordinator. Slot ownership is global: a worker
// advertising jobs = M to N coordinators has capacity M, not N * M, and
// whichever coordinator claims a slot first wins.
pub struct Agent {
    config: WorkerConfig,
    pool: Arc<Pool>,
    executor: Arc<Executor>,
    sessions: Arc<Sessions>,
}

impl Agent {
    pub fn new(config: WorkerConfig) -> Arc<Self> {
        let pool = Arc::new(Pool::new(config.max_jobs));
        let executor = Arc::new(Executor::new(
            config.worktree_dir.clone(),
            config.git_cache_dir.clone(),
            config.use_nix_shell,
        ));
        let sessions = Arc::new(Sessions::default());
        pool.on_slots_changed({
            let sessions = sessions.clone();
            move |slots| sessions.broadcast_ready(slots)
        });
        Arc::new(Self {
            config,
            pool,
            executor,
            sessions,
        })
    }

    // Serve jobs until the token is cancelled.
    pub async fn run(self: Arc<Self>, ct: CancellationToken) -> anyhow::Result<()> {
        self.prewarm().await;
        let mut group = ErrGroup::new(ct.clone());
        for server in self.config.servers.clone() {
            let agent = self.clone();
            let ct = ct.clone();
            group.spawn(async move {
                agent.run_session(&server, &ct).await;
                Ok(())
            });
        }
        group.wait().await
    }

    // Build the configured nix installables up front so the first job
    // doesn't pay for them. Best effort.
    async fn prewarm(&self) {
        for installable in &self.config.prewarm {
            info!("Prewarming {installable}");
            tokio::process::Command::new("nix")
                .args(["build", "--no-link", installable])
                .execute()
                .await
                .or_log_error(&format!("prewarming {installable}"));
        }
    }

    async fn run_session(self: &Arc<Self>, server: &str, ct: &CancellationToken) {
        let mut attempt = 0u32;
        while !ct.is_cancelled() {
            match self.connect_and_serve(server, ct, &mut attempt).await {
                Ok(()) => return,
                Err(e) => {
                    let delay = backoff(attempt);
                    attempt += 1;
                    warn!("Session with {server} failed: {e:#}; retrying in {delay:?}");
                    select! {
                        _ = ct.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    // One connection lifetime. Ok(()) means we were told to shut down;
    // everything else is an error for the reconnect loop to back off on.
    async fn connect_and_serve(
        self: &Arc<Self>,
        server: &str,
        ct: &CancellationToken,
        attempt: &mut u32,
    ) -> anyhow::Result<()> {
        let (ws, _) = connect_async(server)
            .await
            .with_context(|| format!("dialing {server}"))?;
        info!("Connected to {server}");
        *attempt = 0;

        let (mut sink, mut stream) = ws.split();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        // Cancelled by the writer on write failure, or by our caller.
        let conn_ct = ct.child_token();

        let writer = tokio::spawn({
            let ct = conn_ct.clone();
            async move {
                loop {
                    let message = select! {
                        _ = ct.cancelled() => break,
                        message = outbox_rx.recv() => match message {
                            Some(message) => message,
                            None => break,
                        },
                    };
                    match timeout(WRITE_DEADLINE, sink.send(message)).await {
                        Ok(Ok(())) => {}
                        _ => {
                            ct.cancel();
                            break;
                        }
                    }
                }
                let _ = sink.close().await;
            }
        });

        send_frame(
            &outbox_tx,
            Frame::Register {
                worker_id: self.config.id.clone(),
                max_jobs: self.config.max_jobs,
            },
        );
        send_frame(
            &outbox_tx,
            Frame::Ready {
                slots: self.pool.available(),
            },
        );
        self.sessions.insert(server, outbox_tx.clone());

        // Jobs running on behalf of this session, for routing cancels.
        let jobs: Arc<Mutex<HashMap<String, CancellationToken>>> = Default::default();
        let result = self
            .serve_connection(&mut stream, &outbox_tx, &jobs, &conn_ct)
            .await;

        self.sessions.remove(server);
        // Running jobs still hold outbox clones; the token stops the writer
        // without waiting for them.
        conn_ct.cancel();
        drop(outbox_tx);
        let _ = writer.await;
        if ct.is_cancelled() {
            // Shutdown: take running jobs down with us.
            for (_, job_ct) in jobs.lock().drain() {
                job_ct.cancel();
            }
            return Ok(());
        }
        result
    }

    async fn serve_connection(
        self: &Arc<Self>,
        stream: &mut (impl futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        outbox: &mpsc::UnboundedSender<Message>,
        jobs: &Arc<Mutex<HashMap<String, CancellationToken>>>,
        conn_ct: &CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            let message = select! {
                _ = conn_ct.cancelled() => return Err(anyhow!("connection torn down")),
                message = timeout(SERVER_TIMEOUT, stream.next()) => message,
            };
            match message {
                Err(_) => return Err(anyhow!("server silent for {SERVER_TIMEOUT:?}")),
                Ok(None) => return Err(anyhow!("server closed the connection")),
                Ok(Some(Err(e))) => return Err(e).context("reading from server"),
                Ok(Some(Ok(Message::Ping(payload)))) => {
                    // WebSocket-level liveness: answer promptly so the
                    // coordinator keeps considering us alive.
                    let _ = outbox.send(Message::Pong(payload));
                }
                Ok(Some(Ok(Message::Text(text)))) => match Frame::decode(&text) {
                    Ok(Frame::Job(job)) => self.spawn_job(job, outbox.clone(), jobs),
                    Ok(Frame::Cancel { job_id }) => {
                        info!("Coordinator cancelled job {job_id:?}");
                        if let Some(job_ct) = jobs.lock().get(&job_id) {
                            job_ct.cancel();
                        }
                    }
                    Ok(frame) => debug!("Ignoring unexpected frame {frame:?}"),
                    Err(e) => warn!("Dropping bad frame: {e:#}"),
                },
                Ok(Some(Ok(Message::Close(_)))) => {
                    return Err(anyhow!("server closed the connection"))
                }
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    fn spawn_job(
        self: &Arc<Self>,
        job: crate::proto::Job,
        outbox: mpsc::UnboundedSender<Message>,
        jobs: &Arc<Mutex<HashMap<String, CancellationToken>>>,
    ) {
        if !self.pool.acquire() {
            // The coordinator's slot accounting got ahead of reality; the
            // next ready frame self-heals it.
            send_frame(
                &outbox,
                Frame::Error {
                    job_id: job.job_id,
                    message: "no slots available".to_owned(),
                },
            );
            return;
        }
        info!("Starting job {:?}: {:?}", job.job_id, job.command);
        let job_ct = CancellationToken::new();
        jobs.lock().insert(job.job_id.clone(), job_ct.clone());

        let agent = self.clone();
        let jobs = jobs.clone();
        tokio::spawn(async move {
            let callback: OutputCallback = Arc::new({
                let outbox = outbox.clone();
                let job_id = job.job_id.clone();
                move |stream, data: &str| {
                    let _ = outbox.send(Message::Text(
                        Frame::Output {
                            job_id: job_id.clone(),
                            stream,
                            data: data.to_owned(),
                        }
                        .encode(),
                    ));
                }
            });
            let execution = agent.executor.run(&job, &job_ct, Some(callback)).await;
            let duration_ms = execution.duration.as_millis() as u64;
            let frame = match execution.outcome {
                ExecOutcome::Completed { exit_code } => {
                    info!("Job {:?} exited with code {exit_code}", job.job_id);
                    Frame::Complete {
                        job_id: job.job_id.clone(),
                        exit_code,
                        duration_ms,
                    }
                }
                // The coordinator has already synthesized a result for a
                // cancelled job; this frame is dropped over there.
                ExecOutcome::Cancelled => Frame::Complete {
                    job_id: job.job_id.clone(),
                    exit_code: EXIT_CANCELLED,
                    duration_ms,
                },
                ExecOutcome::Failed { message } => {
                    warn!("Job {:?} failed to run: {message}", job.job_id);
                    Frame::Error {
                        job_id: job.job_id.clone(),
                        message,
                    }
                }
            };
            send_frame(&outbox, frame);
            jobs.lock().remove(&job.job_id);
            // Freeing the slot broadcasts a fresh absolute ready to every
            // connected session, this one included.
            agent.pool.release();
        });
    }
}

fn send_frame(outbox: &mpsc::UnboundedSender<Message>, frame: Frame) {
    // Failure means the writer is gone; the read loop notices separately.
    let _ = outbox.send(Message::Text(frame.encode()));
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;

    use super::*;

    #[googletest::test]
    fn backoff_doubles_and_caps() {
        let delays: Vec<u64> = (0..10).map(|n| backoff(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
        // b(0) = 1s, b(n+1) = min(2 * b(n), 60s).
        for n in 0..20 {
            let next = (2 * backoff(n).as_secs()).min(60);
            assert_eq!(backoff(n + 1).as_secs(), next);
        }
    }

    #[googletest::test]
    fn broadcast_reaches_every_session() {
        let sessions = Sessions::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        sessions.insert("ws://a/ws", tx1);
        sessions.insert("ws://b/ws", tx2);
        sessions.broadcast_ready(3);
        let want = Message::Text(Frame::Ready { slots: 3 }.encode());
        assert_eq!(rx1.try_recv().unwrap(), want);
        assert_eq!(rx2.try_recv().unwrap(), want);

        sessions.remove("ws://a/ws");
        sessions.broadcast_ready(2);
        assert_that!(rx1.try_recv(), err(anything()));
        assert_that!(rx2.try_recv(), ok(anything()));
    }

    #[googletest::test]
    fn pool_callback_feeds_broadcast() {
        let sessions = Arc::new(Sessions::default());
        let pool = Pool::new(2);
        pool.on_slots_changed({
            let sessions = sessions.clone();
            move |slots| sessions.broadcast_ready(slots)
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.insert("ws://a/ws", tx);
        assert!(pool.acquire());
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Text(Frame::Ready { slots: 1 }.encode())
        );
    }
}
