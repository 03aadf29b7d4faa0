use std::sync::Arc;

use parking_lot::Mutex;

type SlotsCallback = Arc<dyn Fn(u32) + Send + Sync>;

// Counting semaphore for local job slots. Unlike tokio's Semaphore this is
// deliberately non-blocking: a worker that is out of slots must answer the
// coordinator immediately rather than queue, and the absolute free count
// needs to be observable for `ready` frames.
pub struct Pool {
    max_jobs: u32,
    inner: Mutex<Inner>,
}

struct Inner {
    free: u32,
    callback: Option<SlotsCallback>,
}

impl Pool {
    pub fn new(max_jobs: u32) -> Self {
        Self {
            max_jobs,
            inner: Mutex::new(Inner {
                free: max_jobs,
                callback: None,
            }),
        }
    }

    pub fn max_jobs(&self) -> u32 {
        self.max_jobs
    }

    pub fn available(&self) -> u32 {
        self.inner.lock().free
    }

    // The callback fires after the lock is released, whenever acquire/release
    // actually changes the count. Failed acquires don't fire it.
    pub fn on_slots_changed(&self, callback: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.lock().callback = Some(Arc::new(callback));
    }

    // Claim a slot without blocking. Returns false if none are free.
    pub fn acquire(&self) -> bool {
        let (ok, notify) = {
            let mut inner = self.inner.lock();
            if inner.free == 0 {
                (false, None)
            } else {
                inner.free -= 1;
                (true, inner.callback.clone().map(|cb| (cb, inner.free)))
            }
        };
        if let Some((cb, free)) = notify {
            cb(free);
        }
        ok
    }

    // Return a slot. Releasing above the cap is ignored.
    pub fn release(&self) {
        let notify = {
            let mut inner = self.inner.lock();
            if inner.free == self.max_jobs {
                None
            } else {
                inner.free += 1;
                inner.callback.clone().map(|cb| (cb, inner.free))
            }
        };
        if let Some((cb, free)) = notify {
            cb(free);
        }
    }
}
