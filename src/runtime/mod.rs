//! Scheduling primitives: event loops, deferred task queues, and the
//! named task executor
//!
//! One worker thread owns one event loop and one task queue; everything
//! else in the crate builds on that pairing.

pub mod event_loop;
pub mod executor;
pub mod task_queue;

// Re-export commonly used types
pub use event_loop::{EventLoop, Joiner};
pub use executor::TaskExecutor;
pub use task_queue::{Task, TaskQueue};
