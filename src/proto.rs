use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Applied when a job doesn't specify its own timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

// A request to run a command, as submitted over HTTP and as carried on the
// wire to a worker. The env map is a BTreeMap so that serialization order is
// deterministic and frames round-trip byte-identically.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    /// Git URL or local path. Empty means "run in an ephemeral temp dir".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    /// Ref or SHA to check out. May be empty when repo is empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    /// Single shell string, invoked via `sh -c`.
    pub command: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Job {
    pub fn timeout(&self) -> Duration {
        self.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

// The envelope protocol: one JSON object per WebSocket text frame, with a
// "type" discriminator and a type-specific "payload".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    // Worker to coordinator.
    Register { worker_id: String, max_jobs: u32 },
    /// Absolute free-slot count, not a delta. Lost or reordered updates
    /// self-heal on the next one.
    Ready { slots: u32 },
    Output { job_id: String, stream: Stream, data: String },
    Complete { job_id: String, exit_code: i32, duration_ms: u64 },
    /// Pre-start failure: the job never produced an exit code.
    Error { job_id: String, message: String },
    Pong,
    // Coordinator to worker.
    Job(Job),
    Cancel { job_id: String },
}

const KNOWN_TYPES: &[&str] = &[
    "register", "ready", "output", "complete", "error", "pong", "job", "cancel",
];

// First decode stage: just enough to tell an unknown type apart from a
// malformed payload. Both are dropped by the connection loops, but they log
// differently.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    #[allow(dead_code)]
    payload: Option<Value>,
}

impl Frame {
    pub fn encode(&self) -> String {
        // Frames are built from plain strings and maps, there's no way for
        // serialization to fail on them.
        serde_json::to_string(self).expect("frame serialization failed")
    }

    pub fn decode(text: &str) -> anyhow::Result<Frame> {
        let raw: RawFrame = serde_json::from_str(text).context("invalid frame JSON")?;
        if !KNOWN_TYPES.contains(&raw.kind.as_str()) {
            bail!("unknown frame type {:?}", raw.kind);
        }
        serde_json::from_str(text).with_context(|| format!("malformed {:?} payload", raw.kind))
    }
}
