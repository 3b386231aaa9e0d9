//! Packet bundle channel
//!
//! Frames outbound byte batches as length-prefixed zlib-compressed
//! "bundles" and decompresses inbound ones. Wire format per bundle:
//! `u32` big-endian count of the compressed bytes that follow, then the
//! compressed payload. There is no version byte, no checksum beyond what
//! zlib provides, and no acknowledgment.
//!
//! The channel is non-blocking throughout: `write()` drains the send
//! queue as far as the underlying channel accepts, `process()` makes a
//! bounded number of read attempts before yielding, and both retain
//! partial progress across calls.

use crate::error::{Result, TransportError};
use crate::network::channel::{ByteChannel, IoStatus};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use tracing::{debug, trace, warn};

/// Maximum compressed bundle size. Exceeding it on either path is a
/// protocol violation, not a recoverable condition.
pub const DEFAULT_MAX_BUNDLE_SIZE: usize = 64 * 1024 * 1024;

/// Default cap on frames waiting in the send queue before
/// `queue_bundle` refuses with `SendQueueFull`.
pub const DEFAULT_SEND_QUEUE_LIMIT: usize = 256;

/// Consecutive non-productive read attempts tolerated per `process()`
/// call before yielding back to the scheduler.
const RECV_RETRY_BUDGET: usize = 8;

/// Decompression chunk size.
const INFLATE_CHUNK: usize = 64 * 1024;

/// Decompressed output may exceed the compressed-size cap by at most
/// this factor. The wire cap applies to compressed bytes only; this
/// guard exists solely to stop decompression bombs.
const MAX_INFLATE_RATIO: usize = 128;

/// Buffers retained per capacity bucket.
const POOL_BUCKET_DEPTH: usize = 4;

/// Result of one `process()` or `write()` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleStatus {
    /// `process()`: a complete bundle is ready via [`BundleChannel::receive`].
    /// `write()`: the send queue fully drained.
    Ready,
    /// No progress was made; the caller should cooperatively yield.
    NoProgress,
    /// The underlying channel has closed.
    Closed,
}

// ============================================================================
// Bundle
// ============================================================================

/// One complete decompressed bundle, exposed as a read cursor.
#[derive(Debug)]
pub struct Bundle {
    data: Vec<u8>,
    pos: usize,
}

impl Bundle {
    fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Full payload regardless of cursor position.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Bytes left behind the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Read for Bundle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.remaining().min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// ============================================================================
// Buffer pool
// ============================================================================

/// Bounded reuse pool for frame buffers, bucketed by power-of-two
/// capacity. Owned by one channel, so it is thread-confined along with
/// the connection that owns the channel.
#[derive(Debug, Default)]
pub struct BufferPool {
    buckets: HashMap<usize, Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cleared buffer with at least `min_capacity` capacity, recycled
    /// when one is available.
    pub fn acquire(&mut self, min_capacity: usize) -> Vec<u8> {
        let bucket = min_capacity.next_power_of_two().max(64);
        if let Some(mut buf) = self.buckets.get_mut(&bucket).and_then(Vec::pop) {
            buf.clear();
            return buf;
        }
        Vec::with_capacity(bucket)
    }

    /// Return a buffer for reuse. Buffers beyond the bucket depth are
    /// dropped so the pool stays bounded.
    pub fn release(&mut self, buf: Vec<u8>) {
        let bucket = buf.capacity().next_power_of_two().max(64);
        let slot = self.buckets.entry(bucket).or_default();
        if slot.len() < POOL_BUCKET_DEPTH {
            slot.push(buf);
        }
    }

    #[cfg(test)]
    fn pooled_count(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

// ============================================================================
// Bundle channel
// ============================================================================

/// A partially-sent compressed frame (header + payload) at the head of
/// the send queue keeps its drain position across `write()` calls.
#[derive(Debug)]
struct Frame {
    data: Vec<u8>,
    pos: usize,
}

#[derive(Debug)]
enum RecvPhase {
    Header { bytes: [u8; 4], filled: usize },
    Payload { expected: usize, frame: Vec<u8> },
}

/// Length-prefixed compressed framing over any [`ByteChannel`].
pub struct BundleChannel<C: ByteChannel> {
    channel: C,
    max_bundle_size: usize,
    send_queue_limit: usize,
    /// Uncompressed outbound accumulation, cut into a frame by
    /// `queue_bundle`.
    outbound: Vec<u8>,
    send_queue: VecDeque<Frame>,
    recv: RecvPhase,
    ready: VecDeque<Bundle>,
    pool: BufferPool,
    closed: bool,
}

impl<C: ByteChannel> BundleChannel<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            max_bundle_size: DEFAULT_MAX_BUNDLE_SIZE,
            send_queue_limit: DEFAULT_SEND_QUEUE_LIMIT,
            outbound: Vec::new(),
            send_queue: VecDeque::new(),
            recv: RecvPhase::Header {
                bytes: [0; 4],
                filled: 0,
            },
            ready: VecDeque::new(),
            pool: BufferPool::new(),
            closed: false,
        }
    }

    /// Override the maximum compressed bundle size (default 64 MiB).
    pub fn with_max_bundle_size(mut self, max: usize) -> Self {
        self.max_bundle_size = max;
        self
    }

    /// Override the send queue capacity.
    pub fn with_send_queue_limit(mut self, limit: usize) -> Self {
        self.send_queue_limit = limit;
        self
    }

    /// Append application bytes to the pending outbound bundle.
    pub fn write_buffer(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Bytes accumulated but not yet cut into a bundle.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Frames waiting in the send queue.
    pub fn queued_bundles(&self) -> usize {
        self.send_queue.len()
    }

    /// Compress the accumulated outbound bytes as one bundle and enqueue
    /// it atomically (header and payload as a single frame). A call with
    /// nothing accumulated is a no-op.
    ///
    /// # Errors
    /// - `ConnectionClosed` after `close()`
    /// - `SendQueueFull` when the queue is at capacity
    /// - `BundleTooLarge` when the compressed payload exceeds the maximum
    /// - `Compression` when deflate itself fails
    pub fn queue_bundle(&mut self) -> Result<()> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        if self.outbound.is_empty() {
            return Ok(());
        }
        if self.send_queue.len() >= self.send_queue_limit {
            return Err(TransportError::SendQueueFull {
                queued: self.send_queue.len(),
            });
        }

        // Header placeholder first; the length is known after finish()
        let mut frame = self.pool.acquire(4 + self.outbound.len() / 2);
        frame.extend_from_slice(&[0; 4]);

        let mut encoder = ZlibEncoder::new(frame, Compression::default());
        encoder
            .write_all(&self.outbound)
            .map_err(|e| TransportError::Compression(format!("deflate failed: {e}")))?;
        let mut frame = encoder
            .finish()
            .map_err(|e| TransportError::Compression(format!("deflate finish failed: {e}")))?;

        let compressed_len = frame.len() - 4;
        if compressed_len > self.max_bundle_size {
            self.pool.release(frame);
            return Err(TransportError::BundleTooLarge {
                size: compressed_len,
                max: self.max_bundle_size,
            });
        }
        frame[..4].copy_from_slice(&(compressed_len as u32).to_be_bytes());

        trace!(
            "Queued bundle: {} bytes raw, {} bytes compressed, {} queued",
            self.outbound.len(),
            compressed_len,
            self.send_queue.len() + 1
        );
        self.outbound.clear();
        self.send_queue.push_back(Frame { data: frame, pos: 0 });
        Ok(())
    }

    /// Drain the send queue as far as the channel accepts without
    /// blocking. Partial frames keep their position for the next call.
    ///
    /// Returns `Ready` once the queue is empty, `NoProgress` when the
    /// channel would block, `Closed` when the channel has closed.
    pub fn write(&mut self) -> Result<BundleStatus> {
        if self.closed {
            return Ok(BundleStatus::Closed);
        }
        while let Some(frame) = self.send_queue.front_mut() {
            match self.channel.try_write(&frame.data[frame.pos..])? {
                IoStatus::Ready(n) => {
                    frame.pos += n;
                    if frame.pos >= frame.data.len() {
                        let done = self.send_queue.pop_front().expect("frame present");
                        self.pool.release(done.data);
                    }
                }
                IoStatus::WouldBlock => return Ok(BundleStatus::NoProgress),
                IoStatus::Closed => {
                    debug!(
                        "Channel closed with {} bundles unsent",
                        self.send_queue.len()
                    );
                    self.closed = true;
                    return Ok(BundleStatus::Closed);
                }
            }
        }
        Ok(BundleStatus::Ready)
    }

    /// One receive step: make bounded non-blocking read attempts toward
    /// the next complete bundle.
    ///
    /// Returns `Ready` when a bundle can be taken via
    /// [`receive`](Self::receive), `NoProgress` when the budget ran out
    /// without completing one, `Closed` when the channel has closed.
    /// Repeated calls with no input return `NoProgress` without mutating
    /// any state.
    ///
    /// # Errors
    /// `BundleTooLarge` for an over-limit declared length,
    /// `MalformedBundle` when the payload does not inflate.
    pub fn process(&mut self) -> Result<BundleStatus> {
        if !self.ready.is_empty() {
            return Ok(BundleStatus::Ready);
        }
        if self.closed {
            return Ok(BundleStatus::Closed);
        }

        for _ in 0..RECV_RETRY_BUDGET {
            match self.fill_step()? {
                FillStep::BundleReady => return Ok(BundleStatus::Ready),
                FillStep::Progress => {}
                FillStep::Blocked => return Ok(BundleStatus::NoProgress),
                FillStep::Closed => {
                    self.closed = true;
                    return Ok(BundleStatus::Closed);
                }
            }
        }
        Ok(BundleStatus::NoProgress)
    }

    /// Take the next complete bundle, if any. Bundles are surfaced in
    /// arrival order.
    pub fn receive(&mut self) -> Option<Bundle> {
        self.ready.pop_front()
    }

    /// Close the channel. Bundles still queued for send are abandoned
    /// without error; already-received bundles stay readable.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.send_queue.is_empty() {
            debug!(
                "Closing bundle channel with {} bundles unsent",
                self.send_queue.len()
            );
        }
        self.send_queue.clear();
        self.outbound.clear();
        self.channel.close();
        self.closed = true;
    }

    pub fn is_open(&self) -> bool {
        !self.closed && self.channel.is_open()
    }

    /// Access to the wrapped channel, mainly so TLS sessions underneath
    /// can still be stepped.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    fn fill_step(&mut self) -> Result<FillStep> {
        match &mut self.recv {
            RecvPhase::Header { bytes, filled } => {
                match self.channel.try_read(&mut bytes[*filled..])? {
                    IoStatus::Ready(n) => {
                        *filled += n;
                        if *filled < 4 {
                            return Ok(FillStep::Progress);
                        }
                        let declared = u32::from_be_bytes(*bytes) as usize;
                        if declared == 0 {
                            return Err(TransportError::MalformedBundle(
                                "zero-length bundle".to_string(),
                            ));
                        }
                        if declared > self.max_bundle_size {
                            warn!(
                                "Peer declared bundle of {} bytes (max {})",
                                declared, self.max_bundle_size
                            );
                            return Err(TransportError::BundleTooLarge {
                                size: declared,
                                max: self.max_bundle_size,
                            });
                        }
                        let frame = self.pool.acquire(declared);
                        self.recv = RecvPhase::Payload {
                            expected: declared,
                            frame,
                        };
                        Ok(FillStep::Progress)
                    }
                    IoStatus::WouldBlock => Ok(FillStep::Blocked),
                    IoStatus::Closed => Ok(FillStep::Closed),
                }
            }
            RecvPhase::Payload { expected, frame } => {
                let expected = *expected;
                let start = frame.len();
                frame.resize(expected, 0);
                match self.channel.try_read(&mut frame[start..]) {
                    Ok(IoStatus::Ready(n)) => {
                        frame.truncate(start + n);
                        if start + n < expected {
                            return Ok(FillStep::Progress);
                        }
                        let frame = match std::mem::replace(
                            &mut self.recv,
                            RecvPhase::Header {
                                bytes: [0; 4],
                                filled: 0,
                            },
                        ) {
                            RecvPhase::Payload { frame, .. } => frame,
                            RecvPhase::Header { .. } => unreachable!(),
                        };
                        let bundle = self.inflate(&frame)?;
                        self.pool.release(frame);
                        trace!("Received bundle: {} bytes decompressed", bundle.len());
                        self.ready.push_back(bundle);
                        Ok(FillStep::BundleReady)
                    }
                    Ok(IoStatus::WouldBlock) => {
                        frame.truncate(start);
                        Ok(FillStep::Blocked)
                    }
                    Ok(IoStatus::Closed) => {
                        frame.truncate(start);
                        if start > 0 {
                            debug!("Channel closed mid-bundle ({start}/{expected} bytes)");
                        }
                        Ok(FillStep::Closed)
                    }
                    Err(e) => {
                        frame.truncate(start);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Inflate one complete compressed frame. The compressed length was
    /// already validated against the cap when the header arrived; the
    /// decompressed side is only bounded by the bomb-guard ratio.
    fn inflate(&mut self, compressed: &[u8]) -> Result<Bundle> {
        let inflate_limit = self.max_bundle_size.saturating_mul(MAX_INFLATE_RATIO);
        let mut decoder = ZlibDecoder::new(compressed);
        let mut out = self.pool.acquire(compressed.len() * 2);
        let mut chunk = [0u8; INFLATE_CHUNK];
        loop {
            match decoder.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if out.len() + n > inflate_limit {
                        let size = out.len() + n;
                        self.pool.release(out);
                        return Err(TransportError::BundleTooLarge {
                            size,
                            max: inflate_limit,
                        });
                    }
                    out.extend_from_slice(&chunk[..n]);
                }
                Err(e) => {
                    self.pool.release(out);
                    return Err(TransportError::MalformedBundle(format!(
                        "inflate failed: {e}"
                    )));
                }
            }
        }
        Ok(Bundle::new(out))
    }
}

enum FillStep {
    Progress,
    Blocked,
    BundleReady,
    Closed,
}
