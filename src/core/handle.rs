//! Connection handle
//!
//! The capability object handed to a connection's job. Application code
//! uses it to extend the connection's soft timeout and to observe or
//! request cooperative close. All state is shared atomics, so the handle
//! is cheap to clone across the watchdog, the worker, and the job itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Deadlines are stored as whole milliseconds past this process-wide
/// anchor; zero means "no timeout".
fn anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

struct HandleState {
    id: Uuid,
    should_close: AtomicBool,
    /// Milliseconds past `anchor()`; 0 = no deadline.
    deadline_millis: AtomicU64,
}

/// Shared per-connection control handle.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: Arc<HandleState>,
}

impl ConnectionHandle {
    pub fn new() -> Self {
        // Touch the anchor early so later deadline math never starts
        // from a fresher instant than an already-stored deadline.
        let _ = anchor();
        Self {
            state: Arc::new(HandleState {
                id: Uuid::new_v4(),
                should_close: AtomicBool::new(false),
                deadline_millis: AtomicU64::new(0),
            }),
        }
    }

    /// Unique id for log correlation.
    pub fn id(&self) -> Uuid {
        self.state.id
    }

    /// Extend the connection's deadline to at least `now + timeout`.
    ///
    /// Monotonic under concurrent callers: the effective deadline is
    /// always the maximum ever requested, enforced by a compare-and-swap
    /// loop. A handle that never had a deadline set stays without one.
    pub fn increase_timeout(&self, timeout: Duration) {
        let now = Instant::now().saturating_duration_since(anchor());
        let proposed = (now + timeout).as_millis() as u64;
        // 0 is the "no deadline" sentinel
        let proposed = proposed.max(1);

        let mut current = self.state.deadline_millis.load(Ordering::Acquire);
        while proposed > current {
            match self.state.deadline_millis.compare_exchange_weak(
                current,
                proposed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("Connection {} deadline extended by {:?}", self.state.id, timeout);
                    return;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// The current absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state.deadline_millis.load(Ordering::Acquire) {
            0 => None,
            millis => Some(anchor() + Duration::from_millis(millis)),
        }
    }

    /// True once the deadline exists and has passed.
    pub fn deadline_elapsed(&self) -> bool {
        match self.deadline() {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Ask the connection's job to exit at its next suspension point.
    pub fn request_close(&self) {
        self.state.should_close.store(true, Ordering::Release);
    }

    /// Observed by application code to exit cooperatively.
    pub fn should_close(&self) -> bool {
        self.state.should_close.load(Ordering::Acquire)
    }
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_handle_has_no_deadline() {
        let handle = ConnectionHandle::new();
        assert!(handle.deadline().is_none());
        assert!(!handle.deadline_elapsed());
        assert!(!handle.should_close());
    }

    #[test]
    fn test_increase_timeout_sets_deadline() {
        let handle = ConnectionHandle::new();
        handle.increase_timeout(Duration::from_secs(10));

        let deadline = handle.deadline().expect("Deadline should be set");
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(
            remaining > Duration::from_secs(9),
            "Deadline should be close to 10s out, got {remaining:?}"
        );
    }

    #[test]
    fn test_increase_timeout_is_monotonic() {
        let handle = ConnectionHandle::new();

        handle.increase_timeout(Duration::from_secs(60));
        let first = handle.deadline().unwrap();

        // A shorter extension must never pull the deadline back
        handle.increase_timeout(Duration::from_secs(1));
        let second = handle.deadline().unwrap();

        assert_eq!(first, second, "Shorter timeout must not reduce the deadline");

        handle.increase_timeout(Duration::from_secs(120));
        let third = handle.deadline().unwrap();
        assert!(third > first, "Longer timeout should extend the deadline");
    }

    #[test]
    fn test_effective_deadline_is_max_under_concurrency() {
        let handle = ConnectionHandle::new();
        let timeouts: Vec<u64> = vec![5, 40, 15, 90, 2, 60, 33, 70];
        let max_timeout = *timeouts.iter().max().unwrap();

        let threads: Vec<_> = timeouts
            .into_iter()
            .map(|secs| {
                let handle = handle.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        handle.increase_timeout(Duration::from_secs(secs));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let deadline = handle.deadline().expect("Deadline should be set");
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(
            remaining > Duration::from_secs(max_timeout - 2)
                && remaining <= Duration::from_secs(max_timeout + 1),
            "Effective deadline should equal now + max requested timeout, got {remaining:?}"
        );
    }

    #[test]
    fn test_deadline_elapsed() {
        let handle = ConnectionHandle::new();
        handle.increase_timeout(Duration::from_millis(20));
        assert!(!handle.deadline_elapsed());

        std::thread::sleep(Duration::from_millis(40));
        assert!(handle.deadline_elapsed(), "Deadline should have passed");
    }

    #[test]
    fn test_request_close_is_visible_to_clones() {
        let handle = ConnectionHandle::new();
        let observer = handle.clone();

        handle.request_close();
        assert!(observer.should_close(), "Close flag should be shared");
    }
}
