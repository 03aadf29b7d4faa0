use std::future::Future;
use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::{bail, Context as _};
use futures::{SinkExt as _, StreamExt as _};
use nix::libc::pid_t;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use drover::config::{CoordinatorConfig, WorkerConfig};
use drover::coordinator::Coordinator;
use drover::proto::{Frame, Job, Stream};
use drover::result::Verbosity;
use drover::worker::Agent;

async fn wait_for<F, Fut>(mut predicate: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate().await.context("timeout predicate failed")? {
            return Ok(());
        }
        sleep(Duration::from_millis(50)).await;
    }
    bail!("timeout after {timeout:?}")
}

struct TestCoordinator {
    coordinator: std::sync::Arc<Coordinator>,
    base_url: String,
    ws_url: String,
    ct: CancellationToken,
    client: reqwest::Client,
    _worktree_dir: TempDir,
}

impl TestCoordinator {
    async fn start(embedded: bool) -> Self {
        Self::start_with(embedded, Duration::from_secs(30), Duration::from_secs(90)).await
    }

    async fn start_with(
        embedded: bool,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        let worktree_dir = TempDir::with_prefix("coordinator-test-").unwrap();
        let config = CoordinatorConfig {
            listen_addr: "127.0.0.1".to_owned(),
            port: 0,
            heartbeat_interval,
            heartbeat_timeout,
            retention_capacity: 50,
            verbosity: Verbosity::Minimal,
            embedded_fallback: embedded,
            repo: ".".into(),
            git_daemon: false,
            git_daemon_port: 0,
            git_daemon_listen: None,
            worktree_dir: worktree_dir.path().to_owned(),
            git_cache_dir: None,
            use_nix_shell: false,
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator = Coordinator::new(config);
        let ct = CancellationToken::new();
        tokio::spawn(coordinator.clone().serve(listener, ct.clone()));
        Self {
            coordinator,
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/ws"),
            ct,
            client: reqwest::Client::new(),
            _worktree_dir: worktree_dir,
        }
    }

    async fn post_job(&self, body: Value) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}/job", self.base_url))
            .json(&body)
            .send()
            .await
            .expect("POST /job failed");
        let status = response.status();
        (status, response.json().await.expect("non-JSON response"))
    }

    async fn get(&self, path: &str) -> (reqwest::StatusCode, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .expect("GET failed");
        let status = response.status();
        (status, response.json().await.expect("non-JSON response"))
    }

    async fn worker_count(&self) -> anyhow::Result<usize> {
        let (status, body) = self.get("/status").await;
        if status != reqwest::StatusCode::OK {
            bail!("GET /status returned {status}");
        }
        Ok(body["workers"].as_array().context("no workers array")?.len())
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

// A hand-driven worker session speaking the wire protocol directly, for
// poking at the coordinator's connection handling.
struct FakeWorker {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl FakeWorker {
    async fn register(ws_url: &str, id: &str, max_jobs: u32) -> Self {
        let (ws, _) = connect_async(ws_url).await.expect("couldn't dial coordinator");
        let mut zelf = Self { ws };
        zelf.send(Frame::Register {
            worker_id: id.to_owned(),
            max_jobs,
        })
        .await;
        zelf
    }

    async fn send(&mut self, frame: Frame) {
        self.ws
            .send(Message::Text(frame.encode()))
            .await
            .expect("couldn't send frame");
    }

    // Next protocol frame, answering WebSocket pings along the way.
    async fn next_frame(&mut self, timeout: Duration) -> anyhow::Result<Frame> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let message = tokio::time::timeout_at(deadline, self.ws.next())
                .await
                .context("timed out waiting for frame")?
                .context("connection closed")?
                .context("read error")?;
            match message {
                Message::Text(text) => return Frame::decode(&text),
                Message::Ping(payload) => self
                    .ws
                    .send(Message::Pong(payload))
                    .await
                    .context("sending pong")?,
                _ => {}
            }
        }
    }

    async fn expect_job(&mut self) -> Job {
        match self.next_frame(Duration::from_secs(5)).await.unwrap() {
            Frame::Job(job) => job,
            other => panic!("expected a job frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn embedded_echo() {
    let tc = TestCoordinator::start(true).await;
    let (status, body) = tc
        .post_job(json!({"command": "echo hello", "verbosity": "full"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["output"], "hello\n");
}

#[tokio::test]
async fn embedded_exit_code() {
    let tc = TestCoordinator::start(true).await;
    let (status, body) = tc.post_job(json!({"command": "exit 42"})).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["exit_code"], 42);
}

#[tokio::test]
async fn missing_command_is_rejected() {
    let tc = TestCoordinator::start(true).await;
    let (status, body) = tc.post_job(json!({"repo": ""})).await;
    assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn minimal_verbosity_hides_stdout_but_not_logs() {
    let tc = TestCoordinator::start(true).await;
    let (status, body) = tc
        .post_job(json!({"command": "echo A; echo B >&2", "verbosity": "minimal"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let output = body["output"].as_str().unwrap();
    assert!(output.contains('B'), "stderr missing from {output:?}");
    assert!(!output.contains('A'), "stdout leaked into {output:?}");

    // Retained logs are untouched by verbosity.
    let job_id = body["job_id"].as_str().unwrap();
    let (status, logs) = tc.get(&format!("/logs/{job_id}")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(logs["stdout"], "A\n");
    assert_eq!(logs["stderr"], "B\n");

    // Stream selection zeroes out the other stream.
    let (_, logs) = tc.get(&format!("/logs/{job_id}?stream=stderr")).await;
    assert_eq!(logs["stdout"], "");
    assert_eq!(logs["stderr"], "B\n");
}

#[tokio::test]
async fn normal_verbosity_truncates_stdout() {
    let tc = TestCoordinator::start(true).await;
    let (status, body) = tc
        .post_job(json!({
            "command": "for i in $(seq 1 60); do echo \"line $i\"; done",
            "verbosity": "normal"
        }))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let stdout = body["stdout"].as_str().unwrap();
    assert_eq!(stdout.lines().count(), 50);
    assert_eq!(stdout.lines().next(), Some("line 11"));

    let job_id = body["job_id"].as_str().unwrap();
    let (_, logs) = tc.get(&format!("/logs/{job_id}")).await;
    assert_eq!(logs["stdout"].as_str().unwrap().lines().count(), 60);
}

#[tokio::test]
async fn retention_evicts_oldest_job() {
    let tc = TestCoordinator::start(true).await;
    let mut job_ids = Vec::new();
    for _ in 0..51 {
        let (status, body) = tc.post_job(json!({"command": "true"})).await;
        assert_eq!(status, reqwest::StatusCode::OK);
        job_ids.push(body["job_id"].as_str().unwrap().to_owned());
    }
    let (status, _) = tc.get(&format!("/logs/{}", job_ids[0])).await;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    let (status, _) = tc.get(&format!("/logs/{}", job_ids[1])).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let (status, _) = tc.get(&format!("/logs/{}", job_ids[50])).await;
    assert_eq!(status, reqwest::StatusCode::OK);
}

#[tokio::test]
async fn logs_of_unknown_job_is_404() {
    let tc = TestCoordinator::start(true).await;
    let (status, body) = tc.get("/logs/job-999").await;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn disconnected_workers_jobs_move_elsewhere() {
    let tc = TestCoordinator::start(false).await;
    let mut w1 = FakeWorker::register(&tc.ws_url, "w1", 1).await;
    wait_for(|| async { Ok(tc.worker_count().await? == 1) }, Duration::from_secs(5))
        .await
        .unwrap();

    let (_job_id, rx) = tc.coordinator.submit(drover::coordinator::JobRequest {
        command: "echo moved".to_owned(),
        verbosity: Some(Verbosity::Full),
        ..Default::default()
    });
    let job = w1.expect_job().await;

    // w1 dies without completing it.
    drop(w1);
    wait_for(|| async { Ok(tc.worker_count().await? == 0) }, Duration::from_secs(5))
        .await
        .unwrap();

    let mut w2 = FakeWorker::register(&tc.ws_url, "w2", 1).await;
    let requeued = w2.expect_job().await;
    assert_eq!(requeued.job_id, job.job_id);
    w2.send(Frame::Output {
        job_id: requeued.job_id.clone(),
        stream: Stream::Stdout,
        data: "moved\n".to_owned(),
    })
    .await;
    w2.send(Frame::Complete {
        job_id: requeued.job_id.clone(),
        exit_code: 0,
        duration_ms: 10,
    })
    .await;

    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.output, "moved\n");
}

#[tokio::test]
async fn silent_worker_is_dropped_after_heartbeat_timeout() {
    let tc =
        TestCoordinator::start_with(false, Duration::from_millis(40), Duration::from_millis(100))
            .await;
    let w1 = FakeWorker::register(&tc.ws_url, "w1", 1).await;
    wait_for(|| async { Ok(tc.worker_count().await? == 1) }, Duration::from_secs(5))
        .await
        .unwrap();

    // Stop reading or writing entirely; the read deadline expires without a
    // pong and the coordinator forgets us.
    wait_for(|| async { Ok(tc.worker_count().await? == 0) }, Duration::from_secs(5))
        .await
        .unwrap();
    drop(w1);
}

fn pid_running(pid: pid_t) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

struct TestAgent {
    ct: CancellationToken,
    _worktree_dir: TempDir,
}

impl TestAgent {
    fn start(id: &str, ws_url: &str, max_jobs: u32) -> Self {
        let worktree_dir = TempDir::with_prefix("agent-test-").unwrap();
        let config = WorkerConfig {
            id: id.to_owned(),
            max_jobs,
            servers: vec![ws_url.to_owned()],
            git_cache_dir: None,
            worktree_dir: worktree_dir.path().to_owned(),
            use_nix_shell: false,
            prewarm: Vec::new(),
        };
        let ct = CancellationToken::new();
        tokio::spawn(Agent::new(config).run(ct.clone()));
        Self {
            ct,
            _worktree_dir: worktree_dir,
        }
    }
}

impl Drop for TestAgent {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

#[tokio::test]
async fn real_agent_runs_a_job_end_to_end() {
    let tc = TestCoordinator::start(false).await;
    let _agent = TestAgent::start("agent-1", &tc.ws_url, 2);
    wait_for(|| async { Ok(tc.worker_count().await? == 1) }, Duration::from_secs(5))
        .await
        .unwrap();

    let (status, body) = tc
        .post_job(json!({"command": "echo from-agent; echo warn >&2", "verbosity": "full"}))
        .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["stdout"], "from-agent\n");
    assert_eq!(body["stderr"], "warn\n");

    // The worker reports itself ready again afterwards (its fresh absolute
    // slot count may lag the job result by a frame).
    wait_for(
        || async {
            let (_, status_body) = tc.get("/status").await;
            Ok(status_body["workers"][0]["active_jobs"] == 0 && status_body["queued_jobs"] == 0)
        },
        Duration::from_secs(5),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn cancellation_kills_the_remote_process() {
    let tc = TestCoordinator::start(false).await;
    let _agent = TestAgent::start("agent-1", &tc.ws_url, 1);
    wait_for(|| async { Ok(tc.worker_count().await? == 1) }, Duration::from_secs(5))
        .await
        .unwrap();

    let pid_dir = TempDir::new().unwrap();
    let pid_path = pid_dir.path().join("job_pid");
    let (job_id, rx) = tc.coordinator.submit(drover::coordinator::JobRequest {
        command: format!("echo $$ > {}; sleep 30", pid_path.display()),
        ..Default::default()
    });

    // Wait for the job to actually be running on the agent.
    wait_for(
        || async { Ok(pid_path.exists()) },
        Duration::from_secs(5),
    )
    .await
    .expect("job never started");
    let pid =
        pid_t::from_str(std::fs::read_to_string(&pid_path).unwrap().trim()).unwrap();
    assert!(pid_running(pid));

    tc.coordinator.cancel_job(&job_id);
    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, drover::result::EXIT_CANCELLED);

    wait_for(|| async { Ok(!pid_running(pid)) }, Duration::from_secs(5))
        .await
        .expect("job process survived cancellation");
}

#[tokio::test]
async fn worker_with_no_free_slots_reports_an_error() {
    let tc = TestCoordinator::start(false).await;
    let mut w1 = FakeWorker::register(&tc.ws_url, "w1", 1).await;
    wait_for(|| async { Ok(tc.worker_count().await? == 1) }, Duration::from_secs(5))
        .await
        .unwrap();

    // Two jobs; w1 claims to have capacity again without finishing the
    // first, so the coordinator over-commits and the real pool on a worker
    // would refuse.
    let (_id1, _rx1) = tc.coordinator.submit(drover::coordinator::JobRequest {
        command: "sleep 5".to_owned(),
        ..Default::default()
    });
    let _job1 = w1.expect_job().await;
    w1.send(Frame::Ready { slots: 1 }).await;

    let (_id2, rx2) = tc.coordinator.submit(drover::coordinator::JobRequest {
        command: "echo hi".to_owned(),
        ..Default::default()
    });
    let job2 = w1.expect_job().await;
    w1.send(Frame::Error {
        job_id: job2.job_id.clone(),
        message: "no slots available".to_owned(),
    })
    .await;

    let result = tokio::time::timeout(Duration::from_secs(5), rx2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, drover::result::EXIT_EXEC_FAILED);
    assert!(result.output.contains("no slots available"));
}
