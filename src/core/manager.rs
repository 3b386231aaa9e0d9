//! Connection manager
//!
//! Owns the pool of connection workers, grows it on demand, and
//! load-balances new connections onto the least-occupied worker.

use crate::core::handle::ConnectionHandle;
use crate::core::worker::{
    ConnectionBody, ConnectionFuture, Worker, WorkerHandle, WorkerPoolConfig,
};
use crate::error::{Result, TransportError};
use crate::runtime::Joiner;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Pool of connection workers with least-occupied placement.
pub struct ConnectionManager {
    config: WorkerPoolConfig,
    workers: Mutex<Vec<Arc<Worker>>>,
    next_worker_index: AtomicUsize,
    disposed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            workers: Mutex::new(Vec::new()),
            next_worker_index: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    /// Start `n` additional workers, blocking until all of them have
    /// entered their primary loops. Callable repeatedly to grow the pool;
    /// the pool only ever shrinks through `dispose()`, after which no new
    /// workers can be started.
    ///
    /// # Errors
    /// `TransportError::Io` when a worker thread cannot be spawned,
    /// `TransportError::Internal` once the manager has been disposed.
    pub fn workers(&self, n: usize) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Internal(
                "connection manager already disposed".to_string(),
            ));
        }

        let mut spawned = Vec::with_capacity(n);
        for _ in 0..n {
            let index = self.next_worker_index.fetch_add(1, Ordering::Relaxed);
            let worker = Worker::spawn(format!("worker-{index}"), self.config.clone())?;
            spawned.push(worker);
        }

        // Startup barrier: do not report the pool grown until every new
        // loop is actually polling.
        let joiner = Joiner::new(spawned.iter().map(|w| w.event_loop().clone()).collect());
        joiner.wait_started();

        let mut workers = self.workers.lock().expect("worker set poisoned");
        // dispose() sets the flag before emptying the set, so a recheck
        // under the lock catches a disposal that raced the spawns; those
        // workers would otherwise never be joined
        if self.disposed.load(Ordering::Acquire) {
            drop(workers);
            for worker in &spawned {
                worker.mark();
            }
            joiner.join();
            for worker in &spawned {
                worker.join();
            }
            return Err(TransportError::Internal(
                "connection manager already disposed".to_string(),
            ));
        }
        info!("Worker pool grown by {} to {} workers", n, workers.len() + n);
        workers.extend(spawned);
        Ok(())
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker set poisoned").len()
    }

    /// Approximate connection count per worker, in worker order.
    pub fn connection_counts(&self) -> Vec<usize> {
        self.workers
            .lock()
            .expect("worker set poisoned")
            .iter()
            .map(|worker| worker.connection_count())
            .collect()
    }

    /// Assign a new connection to the least-occupied worker.
    ///
    /// Returns `false` (and does nothing) when no workers exist yet; the
    /// caller decides policy. This is a caller-visible condition, not an
    /// error.
    pub fn add_connection<F, Fut>(&self, timeout: Option<Duration>, body: F) -> bool
    where
        F: FnOnce(WorkerHandle, ConnectionHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let boxed: ConnectionBody =
            Box::new(move |worker, handle| Box::pin(body(worker, handle)) as ConnectionFuture);
        self.add_connection_boxed(timeout, boxed)
    }

    /// Non-generic variant of [`add_connection`](Self::add_connection).
    pub fn add_connection_boxed(&self, timeout: Option<Duration>, body: ConnectionBody) -> bool {
        let target = {
            let workers = self.workers.lock().expect("worker set poisoned");
            if workers.is_empty() {
                warn!("add_connection with no live workers");
                return false;
            }
            workers
                .iter()
                .min_by_key(|worker| worker.connection_count())
                .cloned()
        };

        match target {
            Some(worker) => worker.submit(timeout, body),
            None => false,
        }
    }

    /// Mark and join every worker, then return. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let workers = {
            let mut guard = self.workers.lock().expect("worker set poisoned");
            std::mem::take(&mut *guard)
        };
        if workers.is_empty() {
            return;
        }

        info!("Disposing connection manager ({} workers)", workers.len());
        for worker in &workers {
            worker.mark();
        }

        let joiner = Joiner::new(workers.iter().map(|w| w.event_loop().clone()).collect());
        joiner.join();

        for worker in &workers {
            worker.join();
        }
        info!("Connection manager disposed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
