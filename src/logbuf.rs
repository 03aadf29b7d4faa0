use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::proto::Stream;
use crate::result::{JobResult, Verbosity};

pub const DEFAULT_RETENTION_CAPACITY: usize = 50;

#[derive(Default, Debug, Clone)]
struct Streams {
    stdout: String,
    stderr: String,
}

// Two layers sharing one lock: per-job accumulation while a job runs, and a
// bounded FIFO of completed jobs' untruncated logs. Eviction order equals
// insertion order.
pub struct LogBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    live: HashMap<String, Streams>,
    retained: VecDeque<(String, Streams)>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn accumulate(&self, job_id: &str, stream: Stream, data: &str) {
        let mut inner = self.inner.lock();
        let entry = inner.live.entry(job_id.to_owned()).or_default();
        match stream {
            Stream::Stdout => entry.stdout.push_str(data),
            Stream::Stderr => entry.stderr.push_str(data),
        }
    }

    // Drain a job's accumulated output without retaining it.
    pub fn get_and_clear(&self, job_id: &str) -> String {
        let entry = self.inner.lock().live.remove(job_id).unwrap_or_default();
        format!("{}{}", entry.stdout, entry.stderr)
    }

    // Move a job's accumulated output into the retention cache, evicting the
    // oldest entry if we're at capacity. Jobs that produced no output still
    // get an (empty) entry so their logs are retrievable.
    pub fn retain(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        let entry = inner.live.remove(job_id).unwrap_or_default();
        if inner.retained.len() >= self.capacity {
            inner.retained.pop_front();
        }
        inner.retained.push_back((job_id.to_owned(), entry));
    }

    // Non-destructive lookup of retained logs.
    pub fn get_retained(&self, job_id: &str) -> Option<(String, String)> {
        let inner = self.inner.lock();
        inner
            .retained
            .iter()
            .find(|(id, _)| id == job_id)
            .map(|(_, streams)| (streams.stdout.clone(), streams.stderr.clone()))
    }

    // Terminal composition for a finished job: retain the full logs first,
    // then build the caller-facing result with verbosity applied.
    pub fn complete_job(
        &self,
        job_id: &str,
        exit_code: i32,
        duration_ms: u64,
        verbosity: Verbosity,
    ) -> JobResult {
        self.retain(job_id);
        let (stdout, stderr) = self
            .get_retained(job_id)
            .unwrap_or_else(|| (String::new(), String::new()));
        JobResult::filtered(
            job_id,
            exit_code,
            duration_ms as f64 / 1000.0,
            &stdout,
            &stderr,
            verbosity,
        )
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;

    use super::*;

    #[googletest::test]
    fn accumulates_per_stream_in_order() {
        let buffer = LogBuffer::new(DEFAULT_RETENTION_CAPACITY);
        buffer.accumulate("job-1", Stream::Stdout, "a\n");
        buffer.accumulate("job-1", Stream::Stderr, "x\n");
        buffer.accumulate("job-1", Stream::Stdout, "b\n");
        buffer.retain("job-1");
        assert_eq!(
            buffer.get_retained("job-1"),
            Some(("a\nb\n".to_owned(), "x\n".to_owned()))
        );
    }

    #[googletest::test]
    fn get_and_clear_drops_the_entry() {
        let buffer = LogBuffer::new(DEFAULT_RETENTION_CAPACITY);
        buffer.accumulate("job-1", Stream::Stdout, "out");
        buffer.accumulate("job-1", Stream::Stderr, "err");
        assert_eq!(buffer.get_and_clear("job-1"), "outerr");
        assert_eq!(buffer.get_and_clear("job-1"), "");
    }

    #[googletest::test]
    fn get_retained_is_non_destructive() {
        let buffer = LogBuffer::new(DEFAULT_RETENTION_CAPACITY);
        buffer.accumulate("job-1", Stream::Stdout, "hello\n");
        buffer.retain("job-1");
        assert_that!(buffer.get_retained("job-1"), some(anything()));
        assert_that!(buffer.get_retained("job-1"), some(anything()));
    }

    #[googletest::test]
    fn evicts_oldest_first() {
        let buffer = LogBuffer::new(50);
        for i in 0..=50 {
            let job_id = format!("job-{i}");
            buffer.accumulate(&job_id, Stream::Stdout, "hi\n");
            buffer.retain(&job_id);
        }
        expect_that!(buffer.get_retained("job-0"), none());
        expect_that!(buffer.get_retained("job-1"), some(anything()));
        expect_that!(buffer.get_retained("job-50"), some(anything()));
        assert_eq!(buffer.inner.lock().retained.len(), 50);
    }

    #[googletest::test]
    fn complete_job_retains_full_logs_but_filters_the_result() {
        let buffer = LogBuffer::new(DEFAULT_RETENTION_CAPACITY);
        buffer.accumulate("job-1", Stream::Stdout, "A\n");
        buffer.accumulate("job-1", Stream::Stderr, "B\n");
        let result = buffer.complete_job("job-1", 0, 1500, Verbosity::Minimal);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "");
        assert_eq!(result.stderr, "B\n");
        assert_eq!(result.output, "B\n");
        assert_eq!(result.duration_secs, 1.5);
        // The retained copy is untouched by filtering.
        assert_eq!(
            buffer.get_retained("job-1"),
            Some(("A\n".to_owned(), "B\n".to_owned()))
        );
    }

    #[googletest::test]
    fn complete_job_with_no_output() {
        let buffer = LogBuffer::new(DEFAULT_RETENTION_CAPACITY);
        let result = buffer.complete_job("job-1", 42, 0, Verbosity::Full);
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.output, "");
        assert_that!(buffer.get_retained("job-1"), some(anything()));
    }
}
