//! Producer/consumer flow control.
//!
//! [`BackpressureHandler`] wraps stream endpoints with flow control tied to
//! the memory monitor:
//!
//! - [`ThrottledReader`] is a pass-through stage that buffers up to a
//!   high-water-mark and only requests more upstream data once that buffer
//!   has fully drained. A ceiling breach while buffering surfaces through
//!   the stream's error channel, not as a panic or a call-site exception.
//! - The adaptive variant recomputes the effective high-water-mark from
//!   observed consumption rate and current memory headroom: a static mark
//!   is either too conservative or too aggressive depending on how fast the
//!   destination drains, which varies between disk, network, and in-memory
//!   sinks.
//! - [`ControlledWriter`] turns an async write function into a sink whose
//!   backpressure is the write's own completion latency; write failures
//!   latch and surface on the next use of the sink's error channel.
//! - [`monitor_flow`](BackpressureHandler::monitor_flow) is logging-only
//!   observation. It never feeds back into flow decisions, which would
//!   loop with the adaptive path.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

use crate::error::{Error, MemoryPhase, Result};
use crate::memory::{MemoryMonitor, MemoryReservation};

/// Default high-water-mark for throttled streams.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024;

/// Smallest effective high-water-mark the adaptive path may choose.
const MIN_HIGH_WATER_MARK: usize = 4 * 1024;

/// Largest effective high-water-mark the adaptive path may choose.
const MAX_HIGH_WATER_MARK: usize = 4 * 1024 * 1024;

/// How often the adaptive path re-evaluates the high-water-mark.
const ADAPTIVE_INTERVAL: Duration = Duration::from_millis(250);

/// Counters shared between stream stages and the flow monitor.
#[derive(Debug, Default)]
pub struct FlowStats {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub refills: AtomicU64,
}

/// Factory for flow-controlled stream stages bound to one memory monitor.
pub struct BackpressureHandler {
    monitor: Arc<MemoryMonitor>,
    high_water_mark: usize,
}

impl BackpressureHandler {
    /// The configured mark is honored as given; only the adaptive path
    /// clamps to its own floor and ceiling when retuning.
    pub fn new(monitor: Arc<MemoryMonitor>, high_water_mark: Option<usize>) -> Self {
        Self {
            monitor,
            high_water_mark: high_water_mark.unwrap_or(DEFAULT_HIGH_WATER_MARK).max(1),
        }
    }

    /// Interpose a fixed high-water-mark pass-through stage.
    pub fn throttle<R: AsyncRead + Unpin>(&self, inner: R) -> ThrottledReader<R> {
        ThrottledReader::new(
            inner,
            Arc::clone(&self.monitor),
            self.high_water_mark,
            false,
            None,
        )
    }

    /// As [`throttle`](Self::throttle), but the effective high-water-mark
    /// adapts to consumption rate and memory headroom.
    pub fn throttle_adaptive<R: AsyncRead + Unpin>(&self, inner: R) -> ThrottledReader<R> {
        ThrottledReader::new(
            inner,
            Arc::clone(&self.monitor),
            self.high_water_mark,
            true,
            None,
        )
    }

    /// Throttled stage that also feeds shared flow counters.
    pub fn throttle_observed<R: AsyncRead + Unpin>(
        &self,
        inner: R,
        stats: Arc<FlowStats>,
    ) -> ThrottledReader<R> {
        ThrottledReader::new(
            inner,
            Arc::clone(&self.monitor),
            self.high_water_mark,
            false,
            Some(stats),
        )
    }

    /// Wrap an async write function as a latency-aware sink.
    pub fn controlled_writer<S: ChunkSink>(&self, sink: S) -> ControlledWriter<S> {
        ControlledWriter::new(sink)
    }

    /// Spawn a non-blocking observer that periodically logs flow counters.
    ///
    /// Exits once the stats handle is no longer shared with any stream
    /// stage. Logs only; it must never alter flow-control decisions.
    pub fn monitor_flow(
        &self,
        stats: Arc<FlowStats>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let bytes_in = stats.bytes_in.load(Ordering::Relaxed);
                let bytes_out = stats.bytes_out.load(Ordering::Relaxed);
                let refills = stats.refills.load(Ordering::Relaxed);
                tracing::debug!(bytes_in, bytes_out, refills, "stream flow");
                if Arc::strong_count(&stats) == 1 {
                    break;
                }
            }
        })
    }
}

struct AdaptiveState {
    last_tick: Instant,
    served_since_tick: u64,
}

/// Pass-through reader with drain-then-refill buffering.
pub struct ThrottledReader<R> {
    inner: R,
    monitor: Arc<MemoryMonitor>,
    storage: Vec<u8>,
    filled: usize,
    pos: usize,
    high_water_mark: usize,
    reservation: Option<MemoryReservation>,
    adaptive: Option<AdaptiveState>,
    stats: Option<Arc<FlowStats>>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> ThrottledReader<R> {
    fn new(
        inner: R,
        monitor: Arc<MemoryMonitor>,
        high_water_mark: usize,
        adaptive: bool,
        stats: Option<Arc<FlowStats>>,
    ) -> Self {
        Self {
            inner,
            monitor,
            storage: Vec::new(),
            filled: 0,
            pos: 0,
            high_water_mark: high_water_mark.max(1),
            reservation: None,
            adaptive: adaptive.then(|| AdaptiveState {
                last_tick: Instant::now(),
                served_since_tick: 0,
            }),
            stats,
            eof: false,
        }
    }

    /// Effective high-water-mark currently in force.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Recompute the effective high-water-mark from consumption rate and
    /// memory headroom. Runs only at refill boundaries, when the buffer is
    /// empty, so resizing never discards data.
    fn retune(&mut self) {
        let Some(state) = self.adaptive.as_mut() else {
            return;
        };
        let elapsed = state.last_tick.elapsed();
        if elapsed < ADAPTIVE_INTERVAL {
            return;
        }
        let rate = state.served_since_tick as f64 / elapsed.as_secs_f64();
        state.last_tick = Instant::now();
        state.served_since_tick = 0;

        // Aim for a quarter second of buffered data, bounded by headroom.
        let mut target = (rate * ADAPTIVE_INTERVAL.as_secs_f64()) as usize;
        target = target.clamp(MIN_HIGH_WATER_MARK, MAX_HIGH_WATER_MARK);
        let headroom = self.monitor.headroom();
        if headroom < u64::MAX {
            target = target.min(((headroom / 4).max(MIN_HIGH_WATER_MARK as u64)) as usize);
        }
        if target != self.high_water_mark {
            tracing::trace!(
                old = self.high_water_mark,
                new = target,
                rate,
                "adaptive high-water-mark retuned"
            );
            self.high_water_mark = target;
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Serve buffered bytes until the buffer fully drains.
            if this.pos < this.filled {
                let n = buf.remaining().min(this.filled - this.pos);
                buf.put_slice(&this.storage[this.pos..this.pos + n]);
                this.pos += n;
                if let Some(state) = this.adaptive.as_mut() {
                    state.served_since_tick += n as u64;
                }
                if let Some(stats) = &this.stats {
                    stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                }
                if this.pos == this.filled {
                    // Buffer drained; release its memory charge.
                    this.reservation = None;
                }
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            // Refill boundary: check the ceiling, retune, then buffer up to
            // the high-water-mark before serving again.
            if let Err(e) = this.monitor.check_additional(
                this.high_water_mark as u64,
                MemoryPhase::DuringProcessing,
            ) {
                return Poll::Ready(Err(e.into_io()));
            }
            this.retune();
            if this.storage.len() != this.high_water_mark {
                this.storage.resize(this.high_water_mark, 0);
            }
            if this.reservation.is_none() {
                this.reservation = Some(this.monitor.reserve(this.high_water_mark as u64));
            }
            this.filled = 0;
            this.pos = 0;

            let capacity = this.storage.len();
            loop {
                let mut read_buf = ReadBuf::new(&mut this.storage[this.filled..]);
                let polled = Pin::new(&mut this.inner).poll_read(cx, &mut read_buf);
                let n = read_buf.filled().len();
                drop(read_buf);
                match polled {
                    Poll::Ready(Ok(())) => {
                        if n == 0 {
                            this.eof = true;
                            break;
                        }
                        this.filled += n;
                        if let Some(stats) = &this.stats {
                            stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                        }
                        if this.filled == capacity {
                            break;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        if this.filled > 0 {
                            // Serve what we have instead of stalling.
                            break;
                        }
                        return Poll::Pending;
                    }
                }
            }
            if let Some(stats) = &this.stats {
                stats.refills.fetch_add(1, Ordering::Relaxed);
            }
            if this.filled == 0 {
                this.reservation = None;
                return Poll::Ready(Ok(()));
            }
        }
    }
}

/// Destination for chunks written through a [`ControlledWriter`].
#[async_trait]
pub trait ChunkSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()>;
}

/// Adapter turning an async closure into a [`ChunkSink`].
pub struct SinkFn<F>(pub F);

#[async_trait]
impl<F, Fut> ChunkSink for SinkFn<F>
where
    F: FnMut(Bytes) -> Fut + Send,
    Fut: Future<Output = io::Result<()>> + Send,
{
    async fn write_chunk(&mut self, chunk: Bytes) -> io::Result<()> {
        (self.0)(chunk).await
    }
}

/// Writable sink whose backpressure is the write function's own latency.
///
/// Awaiting [`write`](Self::write) is the flow-control signal: a slow
/// destination slows the producer for free. Once a write fails, the sink
/// latches the failure and every later write reports it through the same
/// error channel.
pub struct ControlledWriter<S: ChunkSink> {
    sink: S,
    failed: Option<(io::ErrorKind, String)>,
    /// Exponentially-weighted moving average of write latency.
    avg_latency: Duration,
    writes: u64,
    bytes_written: u64,
}

/// Above this average write latency the destination counts as congested.
const CONGESTION_LATENCY: Duration = Duration::from_millis(100);

impl<S: ChunkSink> ControlledWriter<S> {
    fn new(sink: S) -> Self {
        Self {
            sink,
            failed: None,
            avg_latency: Duration::ZERO,
            writes: 0,
            bytes_written: 0,
        }
    }

    /// Write one chunk, waiting for the destination to accept it.
    pub async fn write(&mut self, chunk: Bytes) -> Result<()> {
        if let Some((kind, msg)) = &self.failed {
            return Err(Error::StreamProcessing(io::Error::new(*kind, msg.clone())));
        }
        let len = chunk.len() as u64;
        let start = Instant::now();
        match self.sink.write_chunk(chunk).await {
            Ok(()) => {
                let latency = start.elapsed();
                // EWMA with 1/8 weight for the newest sample.
                self.avg_latency = (self.avg_latency * 7 + latency) / 8;
                self.writes += 1;
                self.bytes_written += len;
                Ok(())
            }
            Err(e) => {
                self.failed = Some((e.kind(), e.to_string()));
                Err(Error::StreamProcessing(e))
            }
        }
    }

    /// True when recent writes have been slow enough that the producer
    /// should back off harder than the await alone implies.
    pub fn congested(&self) -> bool {
        self.avg_latency > CONGESTION_LATENCY
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Consume the writer, returning the underlying sink.
    pub fn into_inner(self) -> S {
        self.sink
    }
}
