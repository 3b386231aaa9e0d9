//! Non-blocking transport stack: raw byte channels, the TLS session
//! layer, and length-prefixed compressed bundle framing
//!
//! Layers compose by stacking: `BundleChannel` sits atop either a
//! `TcpChannel` directly or a `TlsSession` wrapping one.

pub mod bundle;
pub mod channel;
pub mod tls;

// Re-export commonly used types
pub use bundle::{Bundle, BundleChannel, BundleStatus, BufferPool, DEFAULT_MAX_BUNDLE_SIZE};
pub use channel::{memory_pair, ByteChannel, IoStatus, MemoryChannel, TcpChannel};
pub use tls::{server_config, TlsOptions, TlsSession, TlsState, TlsStatus, TrustPolicy};
