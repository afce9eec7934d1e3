//! Bounded handler-execution pool with per-connection worker affinity.
//!
//! Each connection maps to one worker queue by its stable id, so a replacement task always
//! runs after the task it superseded. Queue depth is capped per worker; submissions beyond the
//! cap are rejected and surfaced to the dispatch loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tokio::sync::mpsc;
use tracing::{error, warn};

use sweb_common::error::{SwebError, SwebResult};
use sweb_common::ids::WorkerCount;
use sweb_http::handler::{CancelToken, RequestHandler};

use crate::dispatch::{ConnectionRegistry, HandlerTask};

#[derive(Debug)]
struct HandlerJob {
    task: HandlerTask,
    cancel: CancelToken,
}

/// Fixed-size executor for handler tasks.
pub(crate) struct WorkerPool {
    worker_count: u16,
    queue_limit: usize,
    senders: Vec<mpsc::UnboundedSender<HandlerJob>>,
    in_flight_per_worker: Arc<Vec<AtomicUsize>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` handler threads.
    ///
    /// # Errors
    ///
    /// Returns `SwebError::Io` when a worker thread cannot be spawned.
    pub(crate) fn new(
        worker_count: WorkerCount,
        queue_limit: usize,
        handler: Arc<dyn RequestHandler>,
        registry: Arc<ConnectionRegistry>,
    ) -> SwebResult<Self> {
        let count = worker_count.get();
        let in_flight_per_worker =
            Arc::new((0..count).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
        let mut senders = Vec::with_capacity(count as usize);
        let mut workers = Vec::with_capacity(count as usize);

        for index in 0..count {
            let (sender, mut receiver) = mpsc::unbounded_channel::<HandlerJob>();
            senders.push(sender);

            let handler = Arc::clone(&handler);
            let registry = Arc::clone(&registry);
            let in_flight = Arc::clone(&in_flight_per_worker);
            let worker = thread::Builder::new()
                .name(format!("sweb-worker-{index}"))
                .spawn(move || {
                    while let Some(job) = receiver.blocking_recv() {
                        run_handler_job(handler.as_ref(), &registry, &job);
                        let _ = in_flight[usize::from(index)].fetch_sub(1, Ordering::AcqRel);
                    }
                })
                .map_err(|spawn_error| {
                    SwebError::Io(format!("spawn handler worker failed: {spawn_error}"))
                })?;
            workers.push(worker);
        }

        Ok(Self {
            worker_count: count,
            queue_limit,
            senders,
            in_flight_per_worker,
            workers,
        })
    }

    /// Submits one task for execution on the worker owning its connection.
    ///
    /// # Errors
    ///
    /// Returns `SwebError::Capacity` when the owning worker's queue is at its limit, and
    /// `SwebError::InvalidState` after the pool was shut down.
    pub(crate) fn submit(&self, task: HandlerTask, cancel: CancelToken) -> SwebResult<()> {
        let worker = (task.connection_id() % u64::from(self.worker_count)) as usize;
        let in_flight = &self.in_flight_per_worker[worker];
        if in_flight.load(Ordering::Acquire) >= self.queue_limit {
            return Err(SwebError::Capacity(format!(
                "handler worker {worker} queue is at its limit of {}",
                self.queue_limit
            )));
        }

        let _ = in_flight.fetch_add(1, Ordering::AcqRel);
        if self.senders[worker].send(HandlerJob { task, cancel }).is_err() {
            let _ = in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(SwebError::InvalidState("worker pool is shut down"));
        }
        Ok(())
    }

    /// Closes every queue and joins the worker threads.
    pub(crate) fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("queue_limit", &self.queue_limit)
            .field("workers", &self.workers.len())
            .finish()
    }
}

fn run_handler_job(
    handler: &dyn RequestHandler,
    registry: &ConnectionRegistry,
    job: &HandlerJob,
) {
    let connection = job.task.connection_id();
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        handler.handle(&job.task.request, &job.task.channel, &job.cancel)
    }));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(handle_error)) => warn!(connection, "handler failed: {handle_error}"),
        Err(_panic) => error!(connection, "handler panicked; worker continues"),
    }
    registry.finish_task(connection, job.task.task_id);
}
