//! Non-blocking byte channels
//!
//! The socket-transport boundary of the crate: a small trait over
//! non-blocking `read`/`write`/`close`, a TCP implementation on top of
//! tokio, and an in-process loopback pair with bounded capacity. Channel
//! implementations retry their own I/O on the cooperative loop; readiness
//! is never interpreted by the event loop itself.

use crate::error::{Result, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Outcome of one non-blocking I/O attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// `n > 0` bytes were transferred.
    Ready(usize),
    /// No progress was possible right now; retry after yielding.
    WouldBlock,
    /// The peer (or this side) has closed the channel.
    Closed,
}

/// A non-blocking duplex byte channel.
pub trait ByteChannel {
    /// Read available bytes into `buf` without blocking.
    fn try_read(&mut self, buf: &mut [u8]) -> Result<IoStatus>;

    /// Write bytes from `buf` without blocking; partial writes are
    /// normal.
    fn try_write(&mut self, buf: &[u8]) -> Result<IoStatus>;

    /// Close the channel. Safe to call more than once.
    fn close(&mut self);

    /// Local view only; the peer may have closed without our knowledge.
    fn is_open(&self) -> bool;
}

// ============================================================================
// TCP
// ============================================================================

/// TCP byte channel over a non-blocking tokio stream.
pub struct TcpChannel {
    stream: Option<TcpStream>,
    peer: String,
}

impl TcpChannel {
    /// Connect to `host:port` with a connect timeout.
    ///
    /// # Errors
    /// - `TransportError::ConnectionFailed`: resolution failed or the
    ///   connection was refused
    /// - `TransportError::ConnectionTimeout`: the attempt exceeded
    ///   `connect_timeout`
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self> {
        let addr = format!("{host}:{port}");
        info!("Connecting to {} (timeout: {:?})", addr, connect_timeout);

        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                info!("Connected to {}", addr);
                Ok(Self {
                    stream: Some(stream),
                    peer: addr,
                })
            }
            Ok(Err(e)) => {
                error!("Connection failed to {}: {}", addr, e);
                Err(TransportError::ConnectionFailed {
                    host: host.to_string(),
                    port,
                    source: e,
                })
            }
            Err(_) => {
                error!("Connection timeout to {}", addr);
                Err(TransportError::ConnectionTimeout {
                    timeout_secs: connect_timeout.as_secs(),
                })
            }
        }
    }

    /// Wrap an already-established stream (e.g. an accepted socket).
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream: Some(stream),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl ByteChannel for TcpChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<IoStatus> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(IoStatus::Closed);
        };
        match stream.try_read(buf) {
            Ok(0) => {
                info!("Connection closed by {}", self.peer);
                self.stream = None;
                Ok(IoStatus::Closed)
            }
            Ok(n) => Ok(IoStatus::Ready(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
            Err(e) => {
                warn!("Read error from {}: {}", self.peer, e);
                self.stream = None;
                Err(TransportError::Io(e))
            }
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<IoStatus> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(IoStatus::Closed);
        };
        if buf.is_empty() {
            return Ok(IoStatus::WouldBlock);
        }
        match stream.try_write(buf) {
            Ok(0) => Ok(IoStatus::WouldBlock),
            Ok(n) => Ok(IoStatus::Ready(n)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(IoStatus::WouldBlock),
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                info!("Connection to {} reset by peer", self.peer);
                self.stream = None;
                Ok(IoStatus::Closed)
            }
            Err(e) => {
                warn!("Write error to {}: {}", self.peer, e);
                self.stream = None;
                Err(TransportError::Io(e))
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed connection to {}", self.peer);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

// ============================================================================
// In-process loopback
// ============================================================================

struct Pipe {
    buf: VecDeque<u8>,
    closed: bool,
}

impl Pipe {
    fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            buf: VecDeque::new(),
            closed: false,
        }))
    }
}

/// One end of an in-process loopback pair with bounded per-direction
/// capacity. Writes beyond capacity report `WouldBlock`, which makes the
/// pair useful for exercising partial-progress paths in tests.
pub struct MemoryChannel {
    incoming: Arc<Mutex<Pipe>>,
    outgoing: Arc<Mutex<Pipe>>,
    capacity: usize,
    open: bool,
}

/// Create a connected loopback pair with `capacity` bytes of buffering in
/// each direction.
pub fn memory_pair(capacity: usize) -> (MemoryChannel, MemoryChannel) {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let a = MemoryChannel {
        incoming: b_to_a.clone(),
        outgoing: a_to_b.clone(),
        capacity,
        open: true,
    };
    let b = MemoryChannel {
        incoming: a_to_b,
        outgoing: b_to_a,
        capacity,
        open: true,
    };
    (a, b)
}

impl ByteChannel for MemoryChannel {
    fn try_read(&mut self, buf: &mut [u8]) -> Result<IoStatus> {
        if !self.open {
            return Ok(IoStatus::Closed);
        }
        let mut pipe = self.incoming.lock().expect("pipe poisoned");
        if pipe.buf.is_empty() {
            // Buffered bytes drain before a peer close is surfaced
            if pipe.closed {
                return Ok(IoStatus::Closed);
            }
            return Ok(IoStatus::WouldBlock);
        }
        let n = buf.len().min(pipe.buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = pipe.buf.pop_front().expect("length checked");
        }
        Ok(IoStatus::Ready(n))
    }

    fn try_write(&mut self, buf: &[u8]) -> Result<IoStatus> {
        if !self.open {
            return Ok(IoStatus::Closed);
        }
        if buf.is_empty() {
            return Ok(IoStatus::WouldBlock);
        }
        let mut pipe = self.outgoing.lock().expect("pipe poisoned");
        if pipe.closed {
            return Ok(IoStatus::Closed);
        }
        let space = self.capacity.saturating_sub(pipe.buf.len());
        if space == 0 {
            return Ok(IoStatus::WouldBlock);
        }
        let n = space.min(buf.len());
        pipe.buf.extend(&buf[..n]);
        Ok(IoStatus::Ready(n))
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.incoming.lock().expect("pipe poisoned").closed = true;
        self.outgoing.lock().expect("pipe poisoned").closed = true;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
