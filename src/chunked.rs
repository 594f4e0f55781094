//! Chunked payload processing with buffer pooling.
//!
//! Splits buffers and streams into bounded, content-aware pieces. Chunk
//! size is `min(requested, content-type optimal)`: text-like payloads take
//! small chunks to match their access pattern, media and binary payloads
//! take large ones to amortize per-chunk overhead. Concatenating the
//! produced chunks in order always reproduces the input byte-for-byte.
//!
//! Stream reads go through a pooled-buffer arena: read buffers are checked
//! out for exactly one chunk and checked back in once the chunk has been
//! handed off, so a million-chunk extraction does not mean a million
//! transient allocations.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_stream::Stream;

use crate::entry::StreamEntry;
use crate::error::{Error, MemoryPhase, Result};
use crate::filter::content_type_for_name;
use crate::io::ReadAt;
use crate::memory::MemoryMonitor;
use crate::progress::{ProgressEvent, SharedProgressSink};

/// Default chunk size when neither caller nor content type says otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Output of a chunked processing call.
///
/// Invariant: `chunks` concatenated in order reproduce the input exactly,
/// and `total_size` equals the sum of chunk lengths. `chunks` is empty iff
/// `total_size` is zero, which includes every directory entry.
#[derive(Debug)]
pub struct ProcessingResult {
    pub chunks: Vec<Bytes>,
    pub total_size: u64,
    pub processing_time: Duration,
    /// Peak memory growth observed during the call, in bytes.
    pub memory_usage: u64,
}

impl ProcessingResult {
    fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            total_size: 0,
            processing_time: Duration::ZERO,
            memory_usage: 0,
        }
    }
}

/// Options for a single chunked call.
#[derive(Default, Clone)]
pub struct ChunkOptions {
    /// Exact input size when the caller knows it; makes percentage-complete
    /// progress exact instead of estimated.
    pub known_total_size: Option<u64>,
    /// Content type driving the optimal chunk size.
    pub content_type: Option<String>,
    /// Optional progress sink, fired once per chunk.
    pub progress: Option<SharedProgressSink>,
}

/// Reusable read-buffer arena.
///
/// Buffers are checked out for exclusive ownership (they move out of the
/// pool) and checked back in explicitly; at most `max_idle` buffers are
/// retained between calls. A buffer is never shared: it is either fully
/// owned by one checkout or sitting idle in the pool.
pub struct BufferPool {
    idle: Vec<Vec<u8>>,
    max_idle: usize,
    checked_out: usize,
}

impl BufferPool {
    pub fn new(max_idle: usize) -> Self {
        Self {
            idle: Vec::with_capacity(max_idle),
            max_idle,
            checked_out: 0,
        }
    }

    /// Take a cleared buffer with at least `capacity` bytes available.
    pub fn checkout(&mut self, capacity: usize) -> Vec<u8> {
        self.checked_out += 1;
        match self.idle.iter().position(|b| b.capacity() >= capacity) {
            Some(i) => self.idle.swap_remove(i),
            None => Vec::with_capacity(capacity),
        }
    }

    /// Return a buffer to the pool. Dropped instead if the pool is full.
    pub fn checkin(&mut self, mut buf: Vec<u8>) {
        self.checked_out = self.checked_out.saturating_sub(1);
        if self.idle.len() < self.max_idle {
            buf.clear();
            self.idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.checked_out
    }
}

/// Splits large payloads into bounded pieces under the memory ceiling.
pub struct ChunkedProcessor {
    monitor: Arc<MemoryMonitor>,
    pool: BufferPool,
    default_chunk_size: usize,
}

impl ChunkedProcessor {
    pub fn new(monitor: Arc<MemoryMonitor>) -> Self {
        Self::with_chunk_size(monitor, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(monitor: Arc<MemoryMonitor>, default_chunk_size: usize) -> Self {
        Self {
            monitor,
            pool: BufferPool::new(8),
            default_chunk_size: default_chunk_size.max(1),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    fn effective_chunk_size(&self, requested: Option<usize>, content_type: Option<&str>) -> usize {
        let requested = requested.unwrap_or(self.default_chunk_size).max(1);
        requested.min(optimal_chunk_size(content_type))
    }

    /// Split an in-memory payload into chunks.
    ///
    /// The input is copied into shared storage once; each chunk is a view
    /// into it, so chunking cost is one copy regardless of chunk count.
    pub fn process_in_chunks(
        &mut self,
        data: &[u8],
        chunk_size: Option<usize>,
        options: &ChunkOptions,
    ) -> Result<ProcessingResult> {
        let started = Instant::now();
        let start_usage = self.monitor.usage();
        self.monitor.check(MemoryPhase::BeforeProcessing)?;
        if data.is_empty() {
            return Ok(ProcessingResult::empty());
        }

        let chunk_size = self.effective_chunk_size(chunk_size, options.content_type.as_deref());
        let total = options.known_total_size.unwrap_or(data.len() as u64);

        self.monitor
            .check_additional(data.len() as u64, MemoryPhase::DuringProcessing)?;
        let reservation = self.monitor.reserve(data.len() as u64);
        let shared = Bytes::copy_from_slice(data);

        let mut chunks = Vec::with_capacity(data.len().div_ceil(chunk_size));
        let mut peak = start_usage;
        let mut offset = 0usize;
        while offset < data.len() {
            self.monitor.check(MemoryPhase::DuringProcessing)?;
            let end = (offset + chunk_size).min(data.len());
            chunks.push(shared.slice(offset..end));
            offset = end;
            peak = peak.max(self.monitor.usage());
            if let Some(sink) = &options.progress {
                sink.on_progress(&ProgressEvent::new(
                    offset as u64,
                    Some(total),
                    self.monitor.usage(),
                    started.elapsed(),
                ));
            }
        }

        // Ownership of the chunk storage passes to the caller with the
        // returned chunks.
        drop(reservation);

        Ok(ProcessingResult {
            chunks,
            total_size: data.len() as u64,
            processing_time: started.elapsed(),
            memory_usage: peak.saturating_sub(start_usage),
        })
    }

    /// Drain a stream into bounded chunks using pooled read buffers.
    pub async fn process_stream_in_chunks<S: AsyncRead + Unpin>(
        &mut self,
        mut stream: S,
        chunk_size: Option<usize>,
    ) -> Result<Vec<Bytes>> {
        let chunk_size = self.effective_chunk_size(chunk_size, None);
        self.monitor.check(MemoryPhase::BeforeProcessing)?;

        let mut chunks = Vec::new();
        let mut reservation = self.monitor.reserve(0);
        loop {
            self.monitor
                .check_additional(chunk_size as u64, MemoryPhase::DuringProcessing)?;
            let mut buf = self.pool.checkout(chunk_size);
            buf.resize(chunk_size, 0);

            let mut filled = 0usize;
            let eof = loop {
                match stream.read(&mut buf[filled..]).await {
                    Ok(0) => break true,
                    Ok(n) => {
                        filled += n;
                        if filled == chunk_size {
                            break false;
                        }
                    }
                    Err(e) => {
                        self.pool.checkin(buf);
                        return Err(Error::from_io(e));
                    }
                }
            };

            if filled > 0 {
                chunks.push(Bytes::copy_from_slice(&buf[..filled]));
                reservation.grow(filled as u64);
            }
            self.pool.checkin(buf);
            if eof {
                break;
            }
        }
        drop(reservation);
        Ok(chunks)
    }

    /// Chunk one archive entry's payload.
    ///
    /// Directory entries return an empty result without the stream ever
    /// being opened.
    pub async fn process_entry_in_chunks<R: ReadAt + 'static>(
        &mut self,
        entry: &StreamEntry<R>,
        chunk_size: Option<usize>,
        options: &ChunkOptions,
    ) -> Result<ProcessingResult> {
        if entry.is_directory() || entry.size() == 0 {
            return Ok(ProcessingResult::empty());
        }

        let started = Instant::now();
        let start_usage = self.monitor.usage();
        self.monitor.check(MemoryPhase::BeforeProcessing)?;

        let content_type = options
            .content_type
            .clone()
            .or_else(|| content_type_for_name(entry.name()).map(str::to_owned));
        let chunk_size = self.effective_chunk_size(chunk_size, content_type.as_deref());
        let total = options.known_total_size.or(Some(entry.size()));

        let stream = entry.open().await?;
        let mut reader = stream;
        let mut chunks = Vec::new();
        let mut reservation = self.monitor.reserve(0);
        let mut processed = 0u64;
        let mut peak = start_usage;

        loop {
            self.monitor
                .check_additional(chunk_size as u64, MemoryPhase::DuringProcessing)?;
            let mut buf = self.pool.checkout(chunk_size);
            buf.resize(chunk_size, 0);

            let mut filled = 0usize;
            let eof = loop {
                match reader.read(&mut buf[filled..]).await {
                    Ok(0) => break true,
                    Ok(n) => {
                        filled += n;
                        if filled == chunk_size {
                            break false;
                        }
                    }
                    Err(e) => {
                        self.pool.checkin(buf);
                        return Err(Error::from_io(e));
                    }
                }
            };

            if filled > 0 {
                chunks.push(Bytes::copy_from_slice(&buf[..filled]));
                reservation.grow(filled as u64);
                processed += filled as u64;
                peak = peak.max(self.monitor.usage());
                if let Some(sink) = &options.progress {
                    sink.on_progress(&ProgressEvent::new(
                        processed,
                        total,
                        self.monitor.usage(),
                        started.elapsed(),
                    ));
                }
            }
            self.pool.checkin(buf);
            if eof {
                break;
            }
        }
        drop(reservation);

        tracing::trace!(
            entry = entry.name(),
            chunks = chunks.len(),
            bytes = processed,
            "entry chunked"
        );
        Ok(ProcessingResult {
            chunks,
            total_size: processed,
            processing_time: started.elapsed(),
            memory_usage: peak.saturating_sub(start_usage),
        })
    }

    /// Expose the same chunking as a pull-based stream stage.
    pub fn transform<S: AsyncRead + Unpin>(
        &self,
        stream: S,
        chunk_size: Option<usize>,
    ) -> ChunkedTransform<S> {
        ChunkedTransform {
            stream,
            monitor: Arc::clone(&self.monitor),
            chunk_size: self.effective_chunk_size(chunk_size, None),
            buf: Vec::new(),
            filled: 0,
            done: false,
        }
    }
}

/// Content-type-driven chunk sizing.
///
/// Exact values are tuning, not contract; what matters is that text stays
/// small and media/binary stays large.
fn optimal_chunk_size(content_type: Option<&str>) -> usize {
    match content_type {
        Some(t) if t.starts_with("text/") => 16 * 1024,
        Some(t) if t.starts_with("image/") || t.starts_with("video/") || t.starts_with("audio/") => {
            256 * 1024
        }
        Some("application/json") | Some("application/xml") | Some("application/yaml") => 16 * 1024,
        Some(_) => 64 * 1024,
        None => usize::MAX,
    }
}

/// Push-style chunking stage for pipelines that compose streams.
///
/// Errors raised while transforming are emitted as stream items, never
/// thrown from the constructor.
pub struct ChunkedTransform<S> {
    stream: S,
    monitor: Arc<MemoryMonitor>,
    chunk_size: usize,
    buf: Vec<u8>,
    filled: usize,
    done: bool,
}

impl<S: AsyncRead + Unpin> Stream for ChunkedTransform<S> {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if let Err(e) = this
            .monitor
            .check_additional(this.chunk_size as u64, MemoryPhase::DuringProcessing)
        {
            this.done = true;
            return Poll::Ready(Some(Err(e)));
        }
        if this.buf.len() != this.chunk_size {
            this.buf.resize(this.chunk_size, 0);
        }

        loop {
            let mut read_buf = ReadBuf::new(&mut this.buf[this.filled..]);
            let polled = Pin::new(&mut this.stream).poll_read(cx, &mut read_buf);
            let n = read_buf.filled().len();
            drop(read_buf);
            match polled {
                Poll::Ready(Ok(())) => {
                    if n == 0 {
                        this.done = true;
                        if this.filled > 0 {
                            let chunk = Bytes::copy_from_slice(&this.buf[..this.filled]);
                            this.filled = 0;
                            return Poll::Ready(Some(Ok(chunk)));
                        }
                        return Poll::Ready(None);
                    }
                    this.filled += n;
                    if this.filled == this.chunk_size {
                        let chunk = Bytes::copy_from_slice(&this.buf[..this.filled]);
                        this.filled = 0;
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                }
                Poll::Ready(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(Error::from_io(e))));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FixedProbe;
    use tokio_stream::StreamExt;

    fn unlimited() -> ChunkedProcessor {
        ChunkedProcessor::new(Arc::new(MemoryMonitor::unlimited()))
    }

    fn concat(chunks: &[Bytes]) -> Vec<u8> {
        chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }

    #[test]
    fn buffer_round_trip() {
        let mut processor = unlimited();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
        let result = processor
            .process_in_chunks(&data, Some(4096), &ChunkOptions::default())
            .unwrap();
        assert_eq!(result.total_size, data.len() as u64);
        assert_eq!(
            result.chunks.iter().map(Bytes::len).sum::<usize>() as u64,
            result.total_size
        );
        assert_eq!(concat(&result.chunks), data);
    }

    #[test]
    fn exact_chunk_arithmetic() {
        let mut processor = unlimited();
        let data = b"test data for chunking!";
        let result = processor
            .process_in_chunks(data, Some(4), &ChunkOptions::default())
            .unwrap();
        // 23 bytes at 4 per chunk: five full chunks and a 3-byte tail.
        assert_eq!(result.chunks.len(), data.len().div_ceil(4));
        assert!(result.chunks[..5].iter().all(|c| c.len() == 4));
        assert_eq!(result.chunks[5].len(), 3);
    }

    #[test]
    fn empty_input_yields_empty_result() {
        let mut processor = unlimited();
        let result = processor
            .process_in_chunks(&[], Some(16), &ChunkOptions::default())
            .unwrap();
        assert!(result.chunks.is_empty());
        assert_eq!(result.total_size, 0);
    }

    #[test]
    fn content_type_caps_chunk_size() {
        let processor = unlimited();
        assert_eq!(
            processor.effective_chunk_size(Some(1 << 20), Some("text/plain")),
            16 * 1024
        );
        assert_eq!(
            processor.effective_chunk_size(Some(8 * 1024), Some("text/plain")),
            8 * 1024
        );
        assert_eq!(
            processor.effective_chunk_size(Some(1 << 20), Some("video/mp4")),
            256 * 1024
        );
        assert_eq!(processor.effective_chunk_size(None, None), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn ceiling_breach_fails_cleanly() {
        let monitor = Arc::new(MemoryMonitor::with_probe(
            Some(100),
            Arc::new(FixedProbe(500)),
        ));
        let mut processor = ChunkedProcessor::new(monitor);
        let err = processor
            .process_in_chunks(&[0u8; 64], Some(16), &ChunkOptions::default())
            .unwrap_err();
        assert!(err.is_memory_limit());
        assert_eq!(processor.pool().checked_out_count(), 0);
    }

    #[tokio::test]
    async fn stream_chunking_round_trips() {
        let mut processor = unlimited();
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        let chunks = processor
            .process_stream_in_chunks(&data[..], Some(1000))
            .await
            .unwrap();
        assert_eq!(chunks.len(), 50);
        assert_eq!(concat(&chunks), data);
        // Read buffers went back to the arena.
        assert_eq!(processor.pool().checked_out_count(), 0);
        assert!(processor.pool().idle_count() >= 1);
    }

    #[test]
    fn pool_reuses_buffers() {
        let mut pool = BufferPool::new(4);
        let a = pool.checkout(1024);
        let ptr = a.as_ptr();
        pool.checkin(a);
        let b = pool.checkout(512);
        assert_eq!(b.as_ptr(), ptr);
        assert_eq!(pool.checked_out_count(), 1);
        pool.checkin(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn pool_caps_idle_buffers() {
        let mut pool = BufferPool::new(1);
        let a = pool.checkout(64);
        let b = pool.checkout(64);
        pool.checkin(a);
        pool.checkin(b);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn transform_stage_rechunks() {
        let processor = unlimited();
        let data = b"abcdefghij".repeat(10);
        let mut stage = processor.transform(&data[..], Some(32));
        let mut collected = Vec::new();
        let mut sizes = Vec::new();
        while let Some(item) = stage.next().await {
            let chunk = item.unwrap();
            sizes.push(chunk.len());
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, data);
        assert!(sizes[..sizes.len() - 1].iter().all(|&s| s == 32));
    }

    #[tokio::test]
    async fn transform_surfaces_ceiling_as_stream_item() {
        let monitor = Arc::new(MemoryMonitor::with_probe(
            Some(10),
            Arc::new(FixedProbe(100)),
        ));
        let processor = ChunkedProcessor::new(monitor);
        let data = vec![1u8; 256];
        let mut stage = processor.transform(&data[..], Some(64));
        let first = stage.next().await.unwrap();
        assert!(first.unwrap_err().is_memory_limit());
        assert!(stage.next().await.is_none());
    }
}
