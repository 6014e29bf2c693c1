//! Background worker for slow close and delete work.
//!
//! Closing a cold object means re-sealing its content and metadata, and for
//! unlinked inodes also deleting the on-disk pair. None of that belongs on
//! the thread answering a kernel request, so the file table hands the work to
//! this single-consumer queue instead.
//!
//! Completion order is not guaranteed. Failures are logged and swallowed:
//! the kernel-visible operation already succeeded by the time a job runs.
//! Dropping the finalizer closes the queue and joins the workers, so every
//! submitted job completes before shutdown proceeds.

use crossbeam_channel::{unbounded, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Work queue with dedicated worker threads.
pub struct Finalizer {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
}

impl Finalizer {
    /// One worker thread; enough for close traffic since jobs are pure I/O.
    pub fn new() -> Self {
        Self::with_threads(1)
    }

    pub fn with_threads(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            idle: Condvar::new(),
        });

        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                let pending = Arc::clone(&pending);
                std::thread::Builder::new()
                    .name(format!("sealfs-finalizer-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                warn!("finalizer job panicked");
                            }
                            let mut count =
                                pending.count.lock().expect("finalizer counter poisoned");
                            *count -= 1;
                            if *count == 0 {
                                pending.idle.notify_all();
                            }
                        }
                    })
                    .expect("failed to spawn finalizer thread")
            })
            .collect();

        Self {
            tx: Some(tx),
            workers,
            pending,
        }
    }

    /// Queues a job. Never blocks.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut count = self.pending.count.lock().expect("finalizer counter poisoned");
            *count += 1;
        }
        let tx = self.tx.as_ref().expect("finalizer already shut down");
        if tx.send(Box::new(job)).is_err() {
            // Channel closed mid-shutdown; the job is lost but so is the
            // table that submitted it.
            let mut count = self.pending.count.lock().expect("finalizer counter poisoned");
            *count -= 1;
        }
    }

    /// Blocks until every submitted job has finished.
    pub fn wait_idle(&self) {
        let mut count = self.pending.count.lock().expect("finalizer counter poisoned");
        while *count > 0 {
            count = self
                .pending
                .idle
                .wait(count)
                .expect("finalizer counter poisoned");
        }
    }
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain the queue and exit.
        self.tx.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("finalizer worker exited abnormally");
            }
        }
    }
}
