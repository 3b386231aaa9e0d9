//! Deferred task queue
//!
//! A multi-producer/single-consumer queue of zero-argument closures that
//! the owning worker drains once per loop iteration. All cross-thread
//! requests to a worker travel through this queue, so connection logic
//! only ever runs on its own worker thread and needs no further locking.

use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

/// A deferred unit of work, executed on the queue's owning thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe queue of deferred tasks with single-consumer draining.
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(VecDeque::new()),
        }
    }

    /// Enqueue a task for execution on the owning thread.
    ///
    /// Safe to call from any thread, including from inside a task that is
    /// currently being drained.
    pub fn add(&self, task: Task) {
        self.tasks.lock().expect("task queue poisoned").push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain exactly the tasks present when the call was made.
    ///
    /// Tasks added while draining run on the *next* call, which bounds the
    /// work done in one worker loop iteration. Returns the number of
    /// tasks executed.
    pub fn process_current(&self) -> usize {
        let batch = self.tasks.lock().expect("task queue poisoned").len();
        for executed in 0..batch {
            let task = self.tasks.lock().expect("task queue poisoned").pop_front();
            match task {
                Some(task) => task(),
                // Single consumer, so the batch cannot shrink under us;
                // bail defensively all the same.
                None => return executed,
            }
        }
        batch
    }

    /// Drain until the queue is empty, including tasks added while
    /// draining. Used only during forced shutdown.
    pub fn process_drain(&self) -> usize {
        let mut executed = 0;
        loop {
            let drained = self.process_current();
            if drained == 0 {
                break;
            }
            executed += drained;
            if executed > 1_000_000 {
                warn!("Task queue drain exceeded 1M tasks, giving up");
                break;
            }
        }
        executed
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_add_and_process_current() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            queue.add(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        assert_eq!(queue.len(), 5);
        let executed = queue.process_current();
        assert_eq!(executed, 5, "Should run all tasks present at call time");
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_tasks_added_during_drain_run_next_call() {
        let queue = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_counter = counter.clone();
        queue.add(Box::new(move || {
            inner_counter.fetch_add(1, Ordering::SeqCst);
            let counter = inner_counter.clone();
            inner_queue.add(Box::new(move || {
                counter.fetch_add(10, Ordering::SeqCst);
            }));
        }));

        let executed = queue.process_current();
        assert_eq!(executed, 1, "Nested task must not run in the same drain");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1, "Nested task should be pending");

        queue.process_current();
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_process_drain_runs_nested_tasks() {
        let queue = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_counter = counter.clone();
        queue.add(Box::new(move || {
            inner_counter.fetch_add(1, Ordering::SeqCst);
            let counter = inner_counter.clone();
            inner_queue.add(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        let executed = queue.process_drain();
        assert_eq!(executed, 2, "Drain should chase nested tasks to empty");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_multi_producer_single_consumer() {
        let queue = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let counter = counter.clone();
                        queue.add(Box::new(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        let executed = queue.process_drain();
        assert_eq!(executed, 400);
        assert_eq!(counter.load(Ordering::SeqCst), 400);
    }
}
