use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::anyhow;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::proto::Frame;

// What a connection's writer task consumes: protocol frames, plus
// WebSocket-level pings from the heartbeat loop. The channel is the write
// serialization point; frames go out in exactly the order they were queued.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(Frame),
    Ping,
}

// One worker session. Slot changes come from three places only:
// registration (set to max_jobs), dispatch (decrement) and a received
// `ready` (set absolute).
#[derive(Debug)]
pub struct ConnectedWorker {
    pub id: String,
    pub max_jobs: u32,
    connected_at: SystemTime,
    state: Mutex<State>,
    outbox: mpsc::UnboundedSender<Outgoing>,
}

#[derive(Debug)]
struct State {
    slots: u32,
    last_heartbeat: Instant,
}

impl ConnectedWorker {
    pub fn new(id: String, max_jobs: u32, outbox: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            id,
            max_jobs,
            connected_at: SystemTime::now(),
            state: Mutex::new(State {
                slots: max_jobs,
                last_heartbeat: Instant::now(),
            }),
            outbox,
        }
    }

    pub fn slots(&self) -> u32 {
        self.state.lock().slots
    }

    pub fn active_jobs(&self) -> u32 {
        self.max_jobs - self.slots()
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    // Absolute update from a `ready` frame. Clamped so a confused worker
    // can't take slots above its registered capacity.
    pub fn set_slots(&self, slots: u32) {
        self.state.lock().slots = slots.min(self.max_jobs);
    }

    // Claim one slot for a dispatch. False if the worker is full, which can
    // happen when another dispatch won the race since find_ready().
    pub fn take_slot(&self) -> bool {
        let mut state = self.state.lock();
        if state.slots == 0 {
            return false;
        }
        state.slots -= 1;
        true
    }

    pub fn touch(&self) {
        self.state.lock().last_heartbeat = Instant::now();
    }

    pub fn since_heartbeat(&self) -> Duration {
        self.state.lock().last_heartbeat.elapsed()
    }

    // Queue a frame for the writer task. Fails once the connection is gone.
    pub fn send(&self, frame: Frame) -> anyhow::Result<()> {
        self.outbox
            .send(Outgoing::Frame(frame))
            .map_err(|_| anyhow!("connection to worker {:?} is closed", self.id))
    }

    pub fn ping(&self) -> anyhow::Result<()> {
        self.outbox
            .send(Outgoing::Ping)
            .map_err(|_| anyhow!("connection to worker {:?} is closed", self.id))
    }
}

// Thread-safe table of connected workers.
#[derive(Default)]
pub struct Registry {
    workers: Mutex<HashMap<String, Arc<ConnectedWorker>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // Replaces any prior entry with the same id (a worker reconnecting
    // before its old session timed out).
    pub fn register(&self, worker: Arc<ConnectedWorker>) {
        self.workers.lock().insert(worker.id.clone(), worker);
    }

    // Removes the entry only if it is this exact session. A stale session
    // must not tear down its replacement.
    pub fn unregister(&self, worker: &Arc<ConnectedWorker>) {
        let mut workers = self.workers.lock();
        if let Some(current) = workers.get(&worker.id) {
            if Arc::ptr_eq(current, worker) {
                workers.remove(&worker.id);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<ConnectedWorker>> {
        self.workers.lock().get(id).cloned()
    }

    // The worker with the most free slots, or None if everyone is full.
    pub fn find_ready(&self) -> Option<Arc<ConnectedWorker>> {
        self.workers
            .lock()
            .values()
            .filter(|w| w.slots() > 0)
            .max_by_key(|w| w.slots())
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<ConnectedWorker>> {
        self.workers.lock().values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }
}
