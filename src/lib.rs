/// bundlenet - a multi-connection transport layer
///
/// One dedicated OS thread per connection worker, cooperative
/// connection jobs confined to their worker's event loop, and a
/// non-blocking channel stack (TCP, optional TLS, length-prefixed
/// compressed bundle framing) on top.

// Module declarations
pub mod core;
pub mod error;
pub mod network;
pub mod runtime;

// Re-export commonly used types
pub use self::core::{ConnectionHandle, ConnectionManager, Worker, WorkerHandle, WorkerPoolConfig};
pub use error::{Result, TransportError};
pub use network::{
    memory_pair, Bundle, BundleChannel, BundleStatus, ByteChannel, IoStatus, TcpChannel,
    TlsOptions, TlsSession, TlsState, TlsStatus, TrustPolicy,
};
pub use runtime::{EventLoop, Joiner, TaskExecutor, TaskQueue};

/// Initialize logging infrastructure
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();
}
