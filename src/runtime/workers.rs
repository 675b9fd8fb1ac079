//! Worker threads that run completion continuations.
//!
//! The reactor never runs user code itself. Every finished operation is
//! packaged as a [`Job`] and pushed onto an unbounded channel that a fixed
//! set of worker threads drain. A panicking continuation is logged and the
//! worker keeps going.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use async_channel::{Receiver, Sender};
use tracing::{debug, error};

/// A continuation ready to run.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Sending half of the job queue, owned by the reactor.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    tx: Sender<Job>,
}

impl Dispatcher {
    /// Queue `job` for a worker. If every worker is gone the job runs on the
    /// calling thread so that no continuation is lost.
    pub(crate) fn dispatch(&self, job: Job) {
        if let Err(err) = self.tx.try_send(job) {
            debug!("Worker queue closed, running continuation inline");
            run_job(err.into_inner());
        }
    }
}

/// Handles of the spawned worker threads.
pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers; the queue closes once every `Dispatcher` is
    /// dropped, which ends the workers after they drain what is left.
    pub(crate) fn spawn(count: usize) -> io::Result<(Self, Dispatcher)> {
        let (tx, rx) = async_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(count.max(1));

        for worker_id in 0..count.max(1) {
            let rx: Receiver<Job> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("framed-echo-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, rx))?;
            handles.push(handle);
        }

        Ok((Self { handles }, Dispatcher { tx }))
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    /// Wait for every worker to exit. A worker never joins itself.
    pub(crate) fn join(&mut self) {
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

fn worker_loop(worker_id: usize, rx: Receiver<Job>) {
    debug!(worker = worker_id, "Worker started");
    while let Ok(job) = rx.recv_blocking() {
        run_job(job);
    }
    debug!(worker = worker_id, "Worker stopped");
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(panic = %message, "Completion continuation panicked");
    }
}
