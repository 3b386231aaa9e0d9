//! Connection scheduling: workers, the worker pool, and per-connection
//! control handles
//!
//! A `ConnectionManager` owns many `Worker`s; each worker hosts many
//! logical connections, every one of which holds a `ConnectionHandle`.

pub mod handle;
pub mod manager;
pub mod worker;

// Re-export commonly used types
pub use handle::ConnectionHandle;
pub use manager::ConnectionManager;
pub use worker::{ConnectionBody, ConnectionFuture, Worker, WorkerHandle, WorkerPoolConfig};
