//! Named task and thread executor
//!
//! Blocking work (TLS peer verification, worker threads themselves) runs
//! on dedicated named OS threads, never on a worker's event loop thread.

use crate::error::Result;
use std::thread::JoinHandle;
use tracing::debug;

/// Spawns named fire-and-forget tasks and named long-lived threads.
pub struct TaskExecutor;

impl TaskExecutor {
    /// Run a short-lived unit of blocking work on its own named thread.
    ///
    /// # Errors
    /// `TransportError::Io` when the OS refuses to spawn a thread.
    pub fn run_task(name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
        debug!("Spawning task '{}'", name);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        Ok(())
    }

    /// Run a long-lived body on its own named thread and return its
    /// join handle.
    ///
    /// # Errors
    /// `TransportError::Io` when the OS refuses to spawn a thread.
    pub fn run_thread(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>> {
        debug!("Spawning thread '{}'", name);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)?;
        Ok(handle)
    }
}
