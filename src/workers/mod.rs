use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::dispatch::correlator::ResponseCorrelator;
use crate::dispatch::queue::{Job, RequestQueue};
use crate::logging::{LogLevel, Logger};
use crate::processor::Processor;
use crate::stats::ServerStats;
use crate::wire::envelope::{translation_failure, translation_success};

const LOG_CONTEXT: &str = "workers::pool";
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct WorkerPoolConfig {
    pub count: usize,
    pub poll_interval: Duration,
}

/// Fixed set of threads draining the request queue. Each worker runs the
/// processor inside an unwind boundary so a panicking job becomes an
/// error-shaped reply instead of a dead worker.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn spawn(
        config: WorkerPoolConfig,
        queue: Arc<RequestQueue>,
        correlator: Arc<ResponseCorrelator>,
        processor: Arc<dyn Processor>,
        stats: Arc<ServerStats>,
        logger: Arc<Logger>,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(config.count);

        for index in 0..config.count {
            let queue = Arc::clone(&queue);
            let correlator = Arc::clone(&correlator);
            let processor = Arc::clone(&processor);
            let stats = Arc::clone(&stats);
            let logger = Arc::clone(&logger);
            let stop_flag = Arc::clone(&stop_flag);
            let poll_interval = config.poll_interval;

            let handle = thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || {
                    worker_loop(
                        index,
                        poll_interval,
                        &queue,
                        &correlator,
                        processor.as_ref(),
                        &stats,
                        &logger,
                        &stop_flag,
                    );
                })
                .expect("worker thread spawn failed");
            handles.push(handle);
        }

        Self { handles, stop_flag }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Tells every worker to stop after its current job. Workers parked on
    /// the queue notice within one poll interval.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }

    /// Joins the workers, waiting at most `wait` for them to finish.
    /// Returns how many were still busy at the deadline; those threads are
    /// left behind so shutdown can proceed without them.
    pub fn join_with_timeout(self, wait: Duration) -> usize {
        let deadline = Instant::now() + wait;
        let handles = self.handles;

        while Instant::now() < deadline {
            if handles.iter().all(|handle| handle.is_finished()) {
                break;
            }
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        let mut stragglers = 0;
        for handle in handles {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                stragglers += 1;
            }
        }
        stragglers
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    index: usize,
    poll_interval: Duration,
    queue: &RequestQueue,
    correlator: &ResponseCorrelator,
    processor: &dyn Processor,
    stats: &ServerStats,
    logger: &Logger,
    stop_flag: &AtomicBool,
) {
    logger.debug(Some(LOG_CONTEXT), &format!("worker {index} started"));

    while !stop_flag.load(Ordering::Acquire) {
        let Some(job) = queue.dequeue_timeout(poll_interval) else {
            continue;
        };

        process_job(index, job, correlator, processor, stats, logger);
    }

    logger.debug(Some(LOG_CONTEXT), &format!("worker {index} stopped"));
}

fn process_job(
    index: usize,
    job: Job,
    correlator: &ResponseCorrelator,
    processor: &dyn Processor,
    stats: &ServerStats,
    logger: &Logger,
) {
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(&job.payload)));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let reply = match outcome {
        Ok(Ok(translation)) => {
            translation_success(&job.request_id, &translation.text, translation.elapsed_ms)
        }
        Ok(Err(error)) => {
            stats.error_recorded();
            logger.log(
                LogLevel::Warn,
                Some(LOG_CONTEXT),
                &format!("worker {index} job failed"),
                Some(json!({"request_id": job.request_id, "error": error.to_string()})),
            );
            translation_failure(&job.request_id, &error.to_string(), elapsed_ms)
        }
        Err(_) => {
            stats.error_recorded();
            logger.error(
                Some(LOG_CONTEXT),
                &format!("worker {index} caught a processor panic"),
            );
            translation_failure(&job.request_id, "internal processing failure", elapsed_ms)
        }
    };

    if !correlator.fulfill(&job.request_id, reply) {
        logger.debug(
            Some(LOG_CONTEXT),
            &format!("discarded late result for request {}", job.request_id),
        );
    }
}
