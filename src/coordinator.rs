use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitStream;
use futures::{SinkExt as _, StreamExt as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::dispatch::{Dispatcher, EmbeddedFn};
use crate::executor::{ExecOutcome, Executor, OutputCallback};
use crate::logbuf::LogBuffer;
use crate::proto::{Frame, Job, Stream, DEFAULT_TIMEOUT};
use crate::registry::{ConnectedWorker, Outgoing, Registry};
use crate::result::{JobResult, Verbosity, EXIT_EXEC_FAILED};
use crate::util::ResultExt as _;

// Bound on each individual socket write; a worker that can't drain its
// socket this long is as good as dead.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

// The central process: owns the registry, dispatcher and retention buffer,
// and serves the HTTP/WebSocket surfaces.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    logs: Arc<LogBuffer>,
    // Requested verbosity per in-flight job; the wire Job doesn't carry it
    // because it only shapes the submitter's response.
    verbosities: Arc<Mutex<HashMap<String, Verbosity>>>,
    job_counter: AtomicU64,
}

#[derive(Deserialize, Debug, Default)]
pub struct JobRequest {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout: Option<u64>,
    pub verbosity: Option<Verbosity>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new());
        let logs = Arc::new(LogBuffer::new(config.retention_capacity));
        let verbosities: Arc<Mutex<HashMap<String, Verbosity>>> = Default::default();

        let embedded = config.embedded_fallback.then(|| {
            embedded_fn(
                Arc::new(Executor::new(
                    config.worktree_dir.clone(),
                    config.git_cache_dir.clone(),
                    config.use_nix_shell,
                )),
                logs.clone(),
                verbosities.clone(),
                config.verbosity,
            )
        });

        let dispatcher = Dispatcher::new(
            registry.clone(),
            Box::new(|worker: &ConnectedWorker, job: Job| worker.send(Frame::Job(job))),
            Box::new({
                let registry = registry.clone();
                move |worker_id: &str, job_id: &str| {
                    if let Some(worker) = registry.get(worker_id) {
                        worker
                            .send(Frame::Cancel {
                                job_id: job_id.to_owned(),
                            })
                            .or_log_error("sending cancel frame");
                    }
                }
            }),
            embedded,
        );

        Arc::new(Self {
            config,
            registry,
            dispatcher,
            logs,
            verbosities,
            job_counter: AtomicU64::new(0),
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/status", get(status))
            .route("/job", post(submit_job))
            .route("/logs/:job_id", get(get_logs))
            .route("/ws", get(ws_upgrade))
            .with_state(self.clone())
    }

    // Serve HTTP/WebSocket until the token is cancelled. The heartbeat loop
    // lives and dies with the server.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, ct: CancellationToken) -> anyhow::Result<()> {
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(ct.clone()));
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(ct.clone().cancelled_owned())
            .await
            .context("HTTP server failed");
        ct.cancel();
        let _ = heartbeat.await;
        result
    }

    // In-process submission channel (the HTTP handler is a thin wrapper, and
    // other front-ends talk to this directly). Returns the assigned job id
    // and the single-shot result channel.
    pub fn submit(self: &Arc<Self>, request: JobRequest) -> (String, oneshot::Receiver<JobResult>) {
        let job_id = format!("job-{}", self.job_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let verbosity = request.verbosity.unwrap_or(self.config.verbosity);
        self.verbosities.lock().insert(job_id.clone(), verbosity);
        let job = Job {
            job_id: job_id.clone(),
            repo: request.repo,
            commit: request.commit,
            command: request.command,
            env: request.env,
            timeout_secs: request.timeout,
        };
        let rx = self.dispatcher.submit(job);
        (job_id, rx)
    }

    pub fn cancel_job(self: &Arc<Self>, job_id: &str) {
        self.verbosities.lock().remove(job_id);
        self.dispatcher.cancel(job_id);
    }

    pub fn retained_logs(&self, job_id: &str) -> Option<(String, String)> {
        self.logs.get_retained(job_id)
    }

    fn verbosity_for(&self, job_id: &str) -> Verbosity {
        self.verbosities
            .lock()
            .remove(job_id)
            .unwrap_or(self.config.verbosity)
    }

    async fn heartbeat_loop(self: Arc<Self>, ct: CancellationToken) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.tick().await;
        loop {
            select! {
                _ = ct.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for worker in self.registry.all() {
                debug!(
                    "Pinging worker {:?} (last heard {:?} ago)",
                    worker.id,
                    worker.since_heartbeat()
                );
                // A failed queue push means the writer task is already gone
                // and the reader is cleaning up.
                worker.ping().or_log_error("queueing heartbeat ping");
            }
        }
    }

    // One of these runs per accepted WebSocket. Owns the connection: the
    // reader half directly, the writer half through a dedicated task that
    // serializes all frames and pings destined for this worker.
    async fn handle_worker(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut stream) = socket.split();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Outgoing>();
        let conn_ct = CancellationToken::new();

        let writer = tokio::spawn({
            let ct = conn_ct.clone();
            async move {
                loop {
                    let outgoing = select! {
                        _ = ct.cancelled() => break,
                        outgoing = outbox_rx.recv() => match outgoing {
                            Some(outgoing) => outgoing,
                            None => break,
                        },
                    };
                    let message = match outgoing {
                        Outgoing::Frame(frame) => Message::Text(frame.encode()),
                        Outgoing::Ping => Message::Ping(Vec::new()),
                    };
                    match timeout(WRITE_DEADLINE, sink.send(message)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            debug!("WebSocket write failed: {e}");
                            ct.cancel();
                            break;
                        }
                        Err(_) => {
                            debug!("WebSocket write deadline expired");
                            ct.cancel();
                            break;
                        }
                    }
                }
                let _ = sink.close().await;
            }
        });

        // The first frame has to be a registration.
        let worker = match self.read_frame(&mut stream, &conn_ct).await {
            Some(Frame::Register { worker_id, max_jobs }) => {
                info!("Worker {worker_id:?} registered with {max_jobs} slots");
                Arc::new(ConnectedWorker::new(worker_id, max_jobs, outbox_tx.clone()))
            }
            Some(frame) => {
                warn!("Worker sent {frame:?} before registering, closing");
                conn_ct.cancel();
                drop(outbox_tx);
                let _ = writer.await;
                return;
            }
            None => {
                conn_ct.cancel();
                drop(outbox_tx);
                let _ = writer.await;
                return;
            }
        };
        self.registry.register(worker.clone());
        self.dispatcher.try_dispatch();

        while let Some(frame) = self.read_frame(&mut stream, &conn_ct).await {
            worker.touch();
            self.handle_frame(&worker, frame);
        }

        // Terminal for any reason: read error, deadline expiry, writer
        // failure. Exactly one cleanup.
        info!("Worker {:?} disconnected", worker.id);
        conn_ct.cancel();
        drop(outbox_tx);
        let _ = writer.await;
        self.registry.unregister(&worker);
        self.dispatcher.requeue_worker_jobs(&worker.id);
        self.dispatcher.try_dispatch();
    }

    // Next protocol frame, or None when the connection is done for. Any
    // received frame (WebSocket pongs included, axum answers pings for us)
    // pushes the read deadline out. Undecodable frames are logged and
    // dropped without terminating the connection.
    async fn read_frame(
        &self,
        stream: &mut SplitStream<WebSocket>,
        conn_ct: &CancellationToken,
    ) -> Option<Frame> {
        loop {
            let message = select! {
                _ = conn_ct.cancelled() => return None,
                message = timeout(self.config.heartbeat_timeout, stream.next()) => message,
            };
            match message {
                Err(_) => {
                    warn!("Worker read deadline expired");
                    return None;
                }
                Ok(None) => return None,
                Ok(Some(Err(e))) => {
                    debug!("WebSocket read failed: {e}");
                    return None;
                }
                Ok(Some(Ok(Message::Text(text)))) => match Frame::decode(&text) {
                    Ok(frame) => return Some(frame),
                    Err(e) => warn!("Dropping bad frame: {e:#}"),
                },
                Ok(Some(Ok(Message::Close(_)))) => return None,
                // Pings/pongs only matter for liveness, which the timeout
                // restart already covers.
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, worker: &Arc<ConnectedWorker>, frame: Frame) {
        match frame {
            Frame::Ready { slots } => {
                debug!("Worker {:?} ready with {slots} slots", worker.id);
                worker.set_slots(slots);
                self.dispatcher.try_dispatch();
            }
            Frame::Output {
                job_id,
                stream,
                data,
            } => {
                self.logs.accumulate(&job_id, stream, &data);
            }
            Frame::Complete {
                job_id,
                exit_code,
                duration_ms,
            } => {
                let verbosity = self.verbosity_for(&job_id);
                let result = self
                    .logs
                    .complete_job(&job_id, exit_code, duration_ms, verbosity);
                self.dispatcher.complete(&job_id, result);
            }
            Frame::Error { job_id, message } => {
                info!("Worker {:?} failed to start job {job_id:?}: {message}", worker.id);
                let verbosity = self.verbosity_for(&job_id);
                self.logs
                    .accumulate(&job_id, Stream::Stderr, &format!("{message}\n"));
                let result = self
                    .logs
                    .complete_job(&job_id, EXIT_EXEC_FAILED, 0, verbosity);
                self.dispatcher.complete(&job_id, result);
            }
            Frame::Pong => {}
            Frame::Register { .. } | Frame::Job(_) | Frame::Cancel { .. } => {
                warn!(
                    "Ignoring unexpected {frame:?} from registered worker {:?}",
                    worker.id
                );
            }
        }
    }
}

// The in-process fallback worker: same executor as a remote agent, but
// output lands in the log buffer directly instead of crossing a socket.
fn embedded_fn(
    executor: Arc<Executor>,
    logs: Arc<LogBuffer>,
    verbosities: Arc<Mutex<HashMap<String, Verbosity>>>,
    default_verbosity: Verbosity,
) -> EmbeddedFn {
    Arc::new(move |job: Job, ct: CancellationToken| {
        let executor = executor.clone();
        let logs = logs.clone();
        let verbosities = verbosities.clone();
        Box::pin(async move {
            let callback: OutputCallback = Arc::new({
                let logs = logs.clone();
                let job_id = job.job_id.clone();
                move |stream, data: &str| logs.accumulate(&job_id, stream, data)
            });
            let execution = executor.run(&job, &ct, Some(callback)).await;
            let duration_ms = execution.duration.as_millis() as u64;
            let verbosity = verbosities
                .lock()
                .remove(&job.job_id)
                .unwrap_or(default_verbosity);
            let exit_code = execution.exit_code();
            if let ExecOutcome::Failed { message } = &execution.outcome {
                logs.accumulate(&job.job_id, Stream::Stderr, &format!("{message}\n"));
            }
            logs.complete_job(&job.job_id, exit_code, duration_ms, verbosity)
        })
    })
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<Coordinator>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| coordinator.handle_worker(socket))
}

#[derive(Serialize)]
struct WorkerStatus {
    id: String,
    max_jobs: u32,
    active_jobs: u32,
    connected_since: u64,
}

#[derive(Serialize)]
struct StatusResponse {
    workers: Vec<WorkerStatus>,
    queued_jobs: usize,
    local_fallback_active: bool,
}

async fn status(State(coordinator): State<Arc<Coordinator>>) -> Json<StatusResponse> {
    let workers = coordinator
        .registry
        .all()
        .into_iter()
        .map(|worker| WorkerStatus {
            id: worker.id.clone(),
            max_jobs: worker.max_jobs,
            active_jobs: worker.active_jobs(),
            connected_since: worker
                .connected_at()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        })
        .collect();
    Json(StatusResponse {
        workers,
        queued_jobs: coordinator.dispatcher.queued_jobs(),
        local_fallback_active: coordinator.dispatcher.embedded_active(),
    })
}

async fn submit_job(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<JobRequest>,
) -> Response {
    if request.command.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "missing command"})),
        )
            .into_response();
    }
    // The submitter's wait is bounded even when the job asks for a very
    // long run: the job keeps going, the HTTP call doesn't.
    let wait = request
        .timeout
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT)
        .min(DEFAULT_TIMEOUT);
    let (job_id, rx) = coordinator.submit(request);
    match timeout(wait, rx).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"job_id": job_id, "error": "job was dropped without a result"})),
        )
            .into_response(),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"job_id": job_id, "error": "timed out waiting for job result"})),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct LogsQuery {
    stream: Option<String>,
}

async fn get_logs(
    State(coordinator): State<Arc<Coordinator>>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let stream = query.stream.as_deref().unwrap_or("both");
    let (want_stdout, want_stderr) = match stream {
        "stdout" => (true, false),
        "stderr" => (false, true),
        "both" => (true, true),
        other => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("invalid stream {other:?}")})),
            )
                .into_response()
        }
    };
    match coordinator.logs.get_retained(&job_id) {
        Some((stdout, stderr)) => Json(json!({
            "job_id": job_id,
            "stdout": if want_stdout { stdout } else { String::new() },
            "stderr": if want_stderr { stderr } else { String::new() },
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no logs retained for job {job_id:?}")})),
        )
            .into_response(),
    }
}
