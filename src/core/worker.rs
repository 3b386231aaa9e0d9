//! Connection worker
//!
//! One worker owns one OS thread running a current-thread tokio runtime,
//! one event loop, and one deferred task queue. Connection jobs are
//! spawned onto the thread's `LocalSet`, so every suspension point of a
//! job resumes on the same worker thread and connection logic needs no
//! locking of its own.

use crate::core::handle::ConnectionHandle;
use crate::error::Result;
use crate::runtime::{EventLoop, Task, TaskExecutor, TaskQueue};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Poll interval of the primary loop while connections are active.
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Poll interval while waiting out the shutdown grace period.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Tunables shared by every worker in a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Longest the primary loop sleeps when fully idle.
    pub max_worker_sleep_ms: u64,
    /// How long `mark()` waits for jobs to exit voluntarily before
    /// force-cancelling them.
    pub shutdown_grace_ms: u64,
    /// How often a connection's watchdog re-checks its deadline.
    pub watchdog_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_worker_sleep_ms: 100,
            shutdown_grace_ms: 10_000,
            watchdog_interval_ms: 25,
        }
    }
}

impl WorkerPoolConfig {
    pub fn max_worker_sleep(&self) -> Duration {
        Duration::from_millis(self.max_worker_sleep_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// The future a connection body produces. Deliberately not `Send`: it is
/// created and polled only on the owning worker thread.
pub type ConnectionFuture = Pin<Box<dyn Future<Output = Result<()>> + 'static>>;

/// A connection body: a sendable closure that builds the job's future on
/// the worker thread it was assigned to.
pub type ConnectionBody =
    Box<dyn FnOnce(WorkerHandle, ConnectionHandle) -> ConnectionFuture + Send + 'static>;

struct ConnectionRequest {
    timeout: Option<Duration>,
    body: ConnectionBody,
}

/// Lightweight handle to a worker's queue and event loop, passed into
/// every connection job.
#[derive(Clone)]
pub struct WorkerHandle {
    queue: Arc<TaskQueue>,
    event_loop: Arc<EventLoop>,
}

impl WorkerHandle {
    /// Schedule a deferred task onto the worker and wake it.
    pub fn schedule(&self, task: Task) {
        self.queue.add(task);
        self.event_loop.wake();
    }

    pub fn wake(&self) {
        self.event_loop.wake();
    }

    pub fn name(&self) -> &str {
        self.event_loop.name()
    }
}

struct WorkerInner {
    name: String,
    event_loop: Arc<EventLoop>,
    queue: Arc<TaskQueue>,
    sender: mpsc::Sender<ConnectionRequest>,
    connection_count: AtomicUsize,
    config: WorkerPoolConfig,
}

/// One worker thread hosting many logical connections.
pub struct Worker {
    inner: Arc<WorkerInner>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Worker {
    /// Spawn a worker thread and return once the thread exists. Use
    /// `event_loop().wait_started()` (or a `Joiner`) to block until the
    /// primary loop is actually running.
    pub fn spawn(name: impl Into<String>, config: WorkerPoolConfig) -> Result<Arc<Self>> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(WorkerInner {
            event_loop: EventLoop::new(name.clone()),
            queue: Arc::new(TaskQueue::new()),
            sender,
            connection_count: AtomicUsize::new(0),
            config,
            name,
        });

        // The receiver lives on the worker thread, so the channel
        // disconnects (and `submit` starts failing) once the thread exits.
        let thread_inner = inner.clone();
        let thread =
            TaskExecutor::run_thread(&inner.name, move || worker_main(thread_inner, receiver))?;

        Ok(Arc::new(Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.inner.event_loop
    }

    /// Approximate number of connections assigned and not yet finished.
    ///
    /// Read without synchronization; used only for load balancing, never
    /// for correctness.
    pub fn connection_count(&self) -> usize {
        self.inner.connection_count.load(Ordering::Relaxed)
    }

    /// Hand a new connection to this worker. Returns `false` if the
    /// worker has already shut down.
    pub fn submit(&self, timeout: Option<Duration>, body: ConnectionBody) -> bool {
        self.inner.connection_count.fetch_add(1, Ordering::Relaxed);
        let request = ConnectionRequest { timeout, body };
        match self.inner.sender.send(request) {
            Ok(()) => {
                self.inner.event_loop.wake();
                true
            }
            Err(_) => {
                self.inner.connection_count.fetch_sub(1, Ordering::Relaxed);
                warn!("Worker '{}' rejected a connection: already stopped", self.inner.name);
                false
            }
        }
    }

    /// Schedule a deferred task onto the worker thread.
    pub fn schedule(&self, task: Task) {
        self.inner.queue.add(task);
        self.inner.event_loop.wake();
    }

    /// Request shutdown without waiting.
    pub fn mark(&self) {
        self.inner.event_loop.mark();
    }

    /// Block until the worker's loop has joined and its thread exited.
    pub fn join(&self) {
        self.inner.event_loop.join();
        if let Some(thread) = self.thread.lock().expect("worker thread slot poisoned").take() {
            if thread.join().is_err() {
                error!("Worker '{}' thread panicked", self.inner.name);
            }
        }
    }
}

struct ActiveConnection {
    handle: ConnectionHandle,
    supervisor: tokio::task::JoinHandle<()>,
    body_abort: AbortHandle,
}

fn worker_main(inner: Arc<WorkerInner>, incoming: mpsc::Receiver<ConnectionRequest>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Worker '{}' failed to build runtime: {}", inner.name, e);
            inner.event_loop.mark_started();
            inner.event_loop.mark_joined();
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    let loop_inner = inner.clone();
    local.block_on(&runtime, async move {
        primary_loop(loop_inner, incoming).await;
    });
    inner.event_loop.mark_joined();
}

async fn primary_loop(inner: Arc<WorkerInner>, incoming: mpsc::Receiver<ConnectionRequest>) {
    inner.event_loop.mark_started();
    info!("Worker '{}' started", inner.name);

    let mut active: Vec<ActiveConnection> = Vec::new();

    loop {
        inner.queue.process_current();

        let mut accepted = false;
        while let Ok(request) = incoming.try_recv() {
            accepted = true;
            launch(request, &mut active, &inner);
        }

        reap(&mut active, &inner);

        if inner.event_loop.is_marked() {
            break;
        }

        if accepted {
            // Give fresh jobs a first slice before the next iteration
            tokio::task::yield_now().await;
        } else if active.is_empty() {
            inner.event_loop.sleep(inner.config.max_worker_sleep()).await;
        } else {
            // Keep polling responsive while connections are live
            inner.event_loop.sleep(ACTIVE_POLL_INTERVAL).await;
        }
    }

    shutdown(&inner, &mut active).await;
    info!("Worker '{}' stopped", inner.name);
}

fn launch(request: ConnectionRequest, active: &mut Vec<ActiveConnection>, inner: &Arc<WorkerInner>) {
    let handle = ConnectionHandle::new();
    if let Some(timeout) = request.timeout {
        handle.increase_timeout(timeout);
    }
    let id = handle.id();
    debug!("Worker '{}' launching connection {}", inner.name, id);

    let worker_handle = WorkerHandle {
        queue: inner.queue.clone(),
        event_loop: inner.event_loop.clone(),
    };
    let future = (request.body)(worker_handle, handle.clone());
    let body = tokio::task::spawn_local(future);
    let body_abort = body.abort_handle();

    // The watchdog cooperatively polls the wall clock and cancels the
    // body once the handle's deadline has passed.
    let watchdog_abort = if handle.deadline().is_some() {
        let watchdog_handle = handle.clone();
        let watchdog_target = body.abort_handle();
        let interval = inner.config.watchdog_interval();
        let watchdog = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(interval).await;
                if watchdog_handle.deadline_elapsed() {
                    debug!("Connection {} timed out, requesting close", watchdog_handle.id());
                    watchdog_handle.request_close();
                    // One more interval so the parked job gets polled and
                    // can observe the flag before it is cancelled
                    tokio::time::sleep(interval).await;
                    watchdog_target.abort();
                    break;
                }
            }
        });
        Some(watchdog.abort_handle())
    } else {
        None
    };

    // Cancellation is deliberate close or timeout, never an error; any
    // other failure belongs to the job, which closes its own channels.
    let supervisor = tokio::task::spawn_local(async move {
        match body.await {
            Ok(Ok(())) => debug!("Connection {} completed", id),
            Ok(Err(e)) => warn!("Connection {} failed: {}", id, e),
            Err(join_error) if join_error.is_cancelled() => {
                debug!("Connection {} cancelled", id)
            }
            Err(join_error) => error!("Connection {} panicked: {}", id, join_error),
        }
        if let Some(watchdog) = watchdog_abort {
            watchdog.abort();
        }
    });

    active.push(ActiveConnection {
        handle,
        supervisor,
        body_abort,
    });
}

fn reap(active: &mut Vec<ActiveConnection>, inner: &Arc<WorkerInner>) {
    active.retain(|connection| {
        if connection.supervisor.is_finished() {
            inner.connection_count.fetch_sub(1, Ordering::Relaxed);
            false
        } else {
            true
        }
    });
}

async fn shutdown(inner: &Arc<WorkerInner>, active: &mut Vec<ActiveConnection>) {
    info!(
        "Worker '{}' shutting down with {} active connections",
        inner.name,
        active.len()
    );

    for connection in active.iter() {
        connection.handle.request_close();
    }

    let grace_deadline = Instant::now() + inner.config.shutdown_grace();
    while !active.is_empty() && Instant::now() < grace_deadline {
        inner.queue.process_current();
        reap(active, inner);
        if active.is_empty() {
            break;
        }
        inner.event_loop.sleep(SHUTDOWN_POLL_INTERVAL).await;
    }

    if !active.is_empty() {
        warn!(
            "Worker '{}' force-cancelling {} connections after grace period",
            inner.name,
            active.len()
        );
        for connection in active.iter() {
            connection.body_abort.abort();
        }
        while !active.is_empty() {
            reap(active, inner);
            if active.is_empty() {
                break;
            }
            inner.event_loop.sleep(SHUTDOWN_POLL_INTERVAL).await;
        }
    }

    inner.queue.process_drain();
}
