use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::wire::envelope::TranslationRequest;

/// One queued translation job. Consumed exactly once by one worker; the
/// result travels back through the correlator slot keyed by `request_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Job {
    pub request_id: String,
    pub connection_id: u64,
    pub payload: TranslationRequest,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(connection_id: u64, payload: TranslationRequest) -> Self {
        Self {
            request_id: payload.request_id.clone(),
            connection_id,
            payload,
            enqueued_at: Utc::now(),
        }
    }
}

/// Unbounded FIFO shared by connection handlers (producers) and the worker
/// pool (consumers). Dequeue blocks on a condition variable with a bounded
/// wait so a parked worker observes a stop request within one interval.
/// The carried priority tag never reorders anything.
#[derive(Default)]
pub struct RequestQueue {
    jobs: Mutex<VecDeque<Job>>,
    available: Condvar,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, job: Job) {
        self.jobs
            .lock()
            .expect("request queue lock poisoned")
            .push_back(job);
        self.available.notify_one();
    }

    /// Waits up to `wait` for a job. `None` means the interval elapsed with
    /// the queue still empty.
    pub fn dequeue_timeout(&self, wait: Duration) -> Option<Job> {
        let deadline = Instant::now() + wait;
        let mut jobs = self.jobs.lock().expect("request queue lock poisoned");

        loop {
            if let Some(job) = jobs.pop_front() {
                return Some(job);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            let (guard, wait_result) = self
                .available
                .wait_timeout(jobs, remaining)
                .expect("request queue lock poisoned");
            jobs = guard;

            if wait_result.timed_out() && jobs.is_empty() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("request queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
