use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::proto::Job;
use crate::registry::{ConnectedWorker, Registry};
use crate::result::JobResult;

// How the coordinator actually puts a job onto a worker / asks a worker to
// stop one. Injected so this code doesn't know about sockets and doesn't
// need a back-reference to the coordinator.
pub type SendFn = Box<dyn Fn(&ConnectedWorker, Job) -> anyhow::Result<()> + Send + Sync>;
pub type CancelFn = Box<dyn Fn(&str, &str) + Send + Sync>;
// In-process fallback execution, used when no workers are connected.
pub type EmbeddedFn =
    Arc<dyn Fn(Job, CancellationToken) -> BoxFuture<'static, JobResult> + Send + Sync>;

// Coordinator-side tracking record for a submitted job. Lives from submit
// until complete/cancel; while it exists, the submitter's result channel is
// open.
struct PendingJob {
    job: Job,
    result_tx: oneshot::Sender<JobResult>,
    // Empty (None) while queued or running embedded.
    assigned_worker: Option<String>,
}

#[derive(Default)]
struct Inner {
    // Job ids in submission order. Every queued id is in `pending`; the
    // converse doesn't hold (assigned and embedded jobs are only pending).
    queue: VecDeque<String>,
    pending: HashMap<String, PendingJob>,
    // Cancellation handles for in-flight embedded executions.
    embedded_cts: HashMap<String, CancellationToken>,
}

enum Action {
    Dispatch(Arc<ConnectedWorker>, Job),
    Embedded(Job, CancellationToken),
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    send: SendFn,
    cancel: CancelFn,
    embedded: Option<EmbeddedFn>,
    inner: Mutex<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        send: SendFn,
        cancel: CancelFn,
        embedded: Option<EmbeddedFn>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            send,
            cancel,
            embedded,
            inner: Mutex::new(Inner::default()),
        })
    }

    pub fn queued_jobs(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn embedded_active(&self) -> bool {
        self.embedded.is_some()
    }

    // Accept a job. The receiver yields exactly one JobResult, whenever the
    // job completes, errors out or is cancelled.
    pub fn submit(self: &Arc<Self>, job: Job) -> oneshot::Receiver<JobResult> {
        let (result_tx, result_rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.queue.push_back(job.job_id.clone());
            inner.pending.insert(
                job.job_id.clone(),
                PendingJob {
                    job,
                    result_tx,
                    assigned_worker: None,
                },
            );
        }
        self.try_dispatch();
        result_rx
    }

    // Walk the queue handing jobs to workers with free slots, falling back
    // to embedded execution when nobody is connected. Jobs that can't go
    // anywhere stay queued. Called on submit, ready, registration,
    // disconnect-requeue and completion.
    pub fn try_dispatch(self: &Arc<Self>) {
        let actions = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut actions = Vec::new();
            let mut still_queued = VecDeque::new();
            while let Some(job_id) = inner.queue.pop_front() {
                // Ids can linger in the queue after cancellation.
                let Some(pending) = inner.pending.get_mut(&job_id) else {
                    continue;
                };
                if let Some(worker) = self.registry.find_ready() {
                    if worker.take_slot() {
                        pending.assigned_worker = Some(worker.id.clone());
                        actions.push(Action::Dispatch(worker, pending.job.clone()));
                        continue;
                    }
                }
                if self.registry.is_empty() && self.embedded.is_some() {
                    // Once spawned, the embedded task owns this job; a worker
                    // connecting a moment later only gets jobs still queued.
                    let ct = CancellationToken::new();
                    inner.embedded_cts.insert(job_id.clone(), ct.clone());
                    actions.push(Action::Embedded(pending.job.clone(), ct));
                    continue;
                }
                still_queued.push_back(job_id);
            }
            inner.queue = still_queued;
            actions
        };

        for action in actions {
            match action {
                Action::Dispatch(worker, job) => {
                    info!(
                        "Dispatching job {:?} to worker {:?} ({} slots left)",
                        job.job_id,
                        worker.id,
                        worker.slots()
                    );
                    if let Err(e) = (self.send)(&worker, job.clone()) {
                        // Keep it queued; the dead connection gets cleaned up
                        // separately.
                        warn!("Couldn't send job {:?}: {e:#}", job.job_id);
                        let mut inner = self.inner.lock();
                        if let Some(pending) = inner.pending.get_mut(&job.job_id) {
                            pending.assigned_worker = None;
                            inner.queue.push_back(job.job_id.clone());
                        }
                    }
                }
                Action::Embedded(job, ct) => {
                    info!("No workers connected, running job {:?} embedded", job.job_id);
                    let embedded = self.embedded.clone().unwrap();
                    let dispatcher = self.clone();
                    tokio::spawn(async move {
                        let job_id = job.job_id.clone();
                        let result = embedded(job, ct).await;
                        dispatcher.complete(&job_id, result);
                    });
                }
            }
        }
    }

    // Deliver the result and forget the job. No-op for unknown ids, which is
    // how late completions of cancelled jobs get discarded.
    pub fn complete(self: &Arc<Self>, job_id: &str, result: JobResult) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.embedded_cts.remove(job_id);
            inner.pending.remove(job_id)
        };
        let Some(pending) = pending else {
            debug!("Dropping result for unknown job {job_id:?} (cancelled?)");
            return;
        };
        // The submitter may have given up waiting; that's its business.
        let _ = pending.result_tx.send(result);
        self.try_dispatch();
    }

    // Cancellation always wins over completion: the submitter gets the
    // synthetic result now, and whatever the worker later reports for this
    // job id is dropped.
    pub fn cancel(self: &Arc<Self>, job_id: &str) {
        let (pending, embedded_ct) = {
            let mut inner = self.inner.lock();
            let Some(pending) = inner.pending.remove(job_id) else {
                return;
            };
            inner.queue.retain(|id| id != job_id);
            (pending, inner.embedded_cts.remove(job_id))
        };
        info!("Cancelling job {job_id:?}");
        let _ = pending.result_tx.send(JobResult::cancelled(job_id));
        if let Some(ct) = embedded_ct {
            ct.cancel();
        }
        if let Some(worker_id) = pending.assigned_worker {
            (self.cancel)(&worker_id, job_id);
        }
    }

    // Called on worker disconnect: put everything that was running there
    // back in the queue for the next try_dispatch to place elsewhere.
    pub fn requeue_worker_jobs(&self, worker_id: &str) {
        let mut inner = self.inner.lock();
        let mut requeued = Vec::new();
        for (job_id, pending) in inner.pending.iter_mut() {
            if pending.assigned_worker.as_deref() == Some(worker_id) {
                pending.assigned_worker = None;
                requeued.push(job_id.clone());
            }
        }
        for job_id in requeued {
            info!("Requeueing job {job_id:?} from disconnected worker {worker_id:?}");
            inner.queue.push_back(job_id);
        }
    }
}
