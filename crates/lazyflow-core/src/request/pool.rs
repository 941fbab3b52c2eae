//! Bounded worker pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::Shared;

struct PoolInner {
    sender: Mutex<Option<Sender<Arc<Shared>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
    executed: Arc<AtomicU64>,
}

/// A fixed set of named worker threads consuming a shared request queue.
///
/// Cloning yields another handle to the same pool. With zero workers the
/// pool is a marker for synchronous execution.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

impl ThreadPool {
    /// Spawn `num_workers` threads.
    pub fn new(num_workers: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let executed = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let receiver: Receiver<Arc<Shared>> = receiver.clone();
            let executed = Arc::clone(&executed);
            let spawned = thread::Builder::new()
                .name(format!("lazyflow-worker-{i}"))
                .spawn(move || worker_loop(&receiver, &executed));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => tracing::warn!("failed to spawn worker {i}: {err}"),
            }
        }
        let num_workers = workers.len();
        tracing::debug!("thread pool started with {num_workers} workers");
        Self {
            inner: Arc::new(PoolInner {
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
                num_workers,
                executed,
            }),
        }
    }

    /// Number of worker threads (0 = synchronous).
    pub fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    /// Requests executed by workers so far (inline executions not counted).
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// True once [`finalize`](Self::finalize) has run.
    pub fn is_finalized(&self) -> bool {
        self.inner.sender.lock().is_none()
    }

    pub(super) fn enqueue(&self, task: Arc<Shared>) {
        if let Some(sender) = self.inner.sender.lock().as_ref() {
            // a send only fails once every worker is gone; the request then
            // runs in whichever thread waits on it
            let _ = sender.send(task);
        }
    }

    /// Stop accepting work, let the workers drain the queue and join them.
    pub fn finalize(&self) {
        let sender = self.inner.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        let me = thread::current().id();
        for handle in workers {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("a worker thread panicked during shutdown");
            }
        }
        tracing::debug!("thread pool finalized");
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // closing the channel lets detached workers exit
        self.sender.get_mut().take();
    }
}

fn worker_loop(receiver: &Receiver<Arc<Shared>>, executed: &AtomicU64) {
    for task in receiver {
        if let Some(work) = task.claim() {
            task.run(work);
            executed.fetch_add(1, Ordering::Relaxed);
        }
    }
}
