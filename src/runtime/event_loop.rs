//! Joinable event loop primitive
//!
//! Each worker thread owns one `EventLoop`. The loop supports waking from
//! any thread, bounded sleeping, and a cooperative mark/join shutdown
//! handshake. The OS readiness selector itself is the worker's
//! current-thread tokio I/O driver; this type is the cross-thread
//! wake/mark/join surface that sits in front of it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// How often `join()` re-invokes `wake()` while waiting, to avoid a
/// missed-notification deadlock with a loop that is about to sleep.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A one-way boolean gate other threads can block on.
struct Latch {
    opened: Mutex<bool>,
    condvar: Condvar,
}

impl Latch {
    fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn open(&self) {
        let mut opened = self.opened.lock().expect("latch poisoned");
        *opened = true;
        self.condvar.notify_all();
    }

    fn is_open(&self) -> bool {
        *self.opened.lock().expect("latch poisoned")
    }

    /// Block until the latch opens, invoking `tick` at least once per
    /// `interval` while waiting.
    fn wait_with(&self, interval: Duration, mut tick: impl FnMut()) {
        let mut opened = self.opened.lock().expect("latch poisoned");
        while !*opened {
            tick();
            let (guard, _timeout) = self
                .condvar
                .wait_timeout(opened, interval)
                .expect("latch poisoned");
            opened = guard;
        }
    }
}

/// Joinable event loop handle shared between a worker thread and the rest
/// of the process.
///
/// `wake()` is edge-triggered: a wake that arrives before the next
/// `sleep()` still causes that sleep to return immediately, at most once
/// per wake/sleep pair.
pub struct EventLoop {
    name: String,
    notify: Notify,
    marked: AtomicBool,
    started: Latch,
    joined: Latch,
}

impl EventLoop {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            notify: Notify::new(),
            marked: AtomicBool::new(false),
            started: Latch::new(),
            joined: Latch::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wake the owning thread out of its next (or current) sleep.
    ///
    /// Safe to call from any thread. A single stored wake permit is kept
    /// if nobody is sleeping yet.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Sleep up to `timeout` unless a wake is pending or arrives.
    ///
    /// Only the owning worker thread calls this. Readiness results for
    /// individual sockets are not interpreted here; channel
    /// implementations retry their own non-blocking I/O.
    pub async fn sleep(&self, timeout: Duration) {
        if timeout.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }

    /// Request cooperative shutdown and wake the loop so it notices.
    pub fn mark(&self) {
        debug!("Event loop '{}' marked for shutdown", self.name);
        self.marked.store(true, Ordering::Release);
        self.wake();
    }

    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    /// Called by the owning thread once its runtime is up and it is about
    /// to enter the primary loop.
    pub fn mark_started(&self) {
        self.started.open();
    }

    /// Called by the owning thread as the very last thing before exit.
    pub fn mark_joined(&self) {
        debug!("Event loop '{}' joined", self.name);
        self.joined.open();
    }

    pub fn is_joined(&self) -> bool {
        self.joined.is_open()
    }

    /// Block until the owning thread has entered its primary loop.
    pub fn wait_started(&self) {
        self.started.wait_with(JOIN_POLL_INTERVAL, || {});
    }

    /// Block the calling thread until the loop reports joined.
    ///
    /// Re-invokes `wake()` on every poll interval so a loop that went to
    /// sleep after `mark()` cannot be missed.
    pub fn join(&self) {
        self.joined.wait_with(JOIN_POLL_INTERVAL, || self.wake());
    }
}

/// Barrier over several event loops, used to synchronize worker pool
/// startup and shutdown.
pub struct Joiner {
    loops: Vec<Arc<EventLoop>>,
}

impl Joiner {
    pub fn new(loops: Vec<Arc<EventLoop>>) -> Self {
        Self { loops }
    }

    /// Block until every loop has started.
    pub fn wait_started(&self) {
        for event_loop in &self.loops {
            event_loop.wait_started();
        }
    }

    /// Block until every loop has joined.
    pub fn join(&self) {
        for event_loop in &self.loops {
            event_loop.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_wake_before_sleep_returns_immediately() {
        let event_loop = EventLoop::new("test");

        event_loop.wake();

        let start = Instant::now();
        event_loop.sleep(Duration::from_secs(5)).await;
        assert!(
            start.elapsed() < Duration::from_millis(500),
            "Pending wake should cut the sleep short"
        );
    }

    #[tokio::test]
    async fn test_wake_permit_is_consumed_once() {
        let event_loop = EventLoop::new("test");

        event_loop.wake();
        event_loop.wake();

        // First sleep consumes the single stored permit
        event_loop.sleep(Duration::from_secs(5)).await;

        // Second sleep must actually wait out its timeout
        let start = Instant::now();
        event_loop.sleep(Duration::from_millis(50)).await;
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "Second sleep should not see a leftover permit"
        );
    }

    #[tokio::test]
    async fn test_sleep_times_out() {
        let event_loop = EventLoop::new("test");

        let start = Instant::now();
        event_loop.sleep(Duration::from_millis(50)).await;
        assert!(
            start.elapsed() >= Duration::from_millis(40),
            "Sleep should block close to the requested timeout"
        );
    }

    #[tokio::test]
    async fn test_wake_from_other_thread_interrupts_sleep() {
        let event_loop = EventLoop::new("test");
        let remote = event_loop.clone();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.wake();
        });

        let start = Instant::now();
        event_loop.sleep(Duration::from_secs(5)).await;
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "Cross-thread wake should interrupt the sleep"
        );
        waker.join().unwrap();
    }

    #[test]
    fn test_mark_and_join_handshake() {
        let event_loop = EventLoop::new("test");
        let owned = event_loop.clone();

        let worker = std::thread::spawn(move || {
            owned.mark_started();
            while !owned.is_marked() {
                std::thread::sleep(Duration::from_millis(5));
            }
            owned.mark_joined();
        });

        event_loop.wait_started();
        assert!(!event_loop.is_joined());

        event_loop.mark();
        event_loop.join();
        assert!(event_loop.is_joined(), "Loop should report joined");
        worker.join().unwrap();
    }

    #[test]
    fn test_joiner_waits_for_all_loops() {
        let loops: Vec<_> = (0..3).map(|i| EventLoop::new(format!("loop-{i}"))).collect();

        let handles: Vec<_> = loops
            .iter()
            .map(|event_loop| {
                let owned = event_loop.clone();
                std::thread::spawn(move || {
                    owned.mark_started();
                    std::thread::sleep(Duration::from_millis(20));
                    owned.mark_joined();
                })
            })
            .collect();

        let joiner = Joiner::new(loops.clone());
        joiner.wait_started();
        joiner.join();

        for event_loop in &loops {
            assert!(event_loop.is_joined(), "Every loop should have joined");
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
