//! Streaming entry payloads.
//!
//! [`EntryReader`] exposes one entry's bytes as a `tokio::io::AsyncRead`
//! without ever materializing the payload: compressed data is pulled from
//! the source one bounded slab at a time, and DEFLATE entries are inflated
//! incrementally as the consumer reads. Resident memory per open reader is
//! therefore one slab plus the inflater's window, independent of entry
//! size.
//!
//! A reader is single-consumer and not seekable; re-reading an entry means
//! opening a new reader from the parser.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flate2::{Decompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, ReadBuf};

use crate::io::ReadAt;

use super::structures::CompressionMethod;

/// How much compressed data one source read pulls in.
const DEFAULT_SLAB_SIZE: usize = 64 * 1024;

type SlabFuture = Pin<Box<dyn Future<Output = io::Result<Vec<u8>>> + Send>>;

/// Lazily-pulled byte stream over a single archive entry.
pub struct EntryReader<R: ReadAt> {
    source: Arc<R>,
    method: CompressionMethod,
    next_offset: u64,
    remaining_compressed: u64,
    remaining_uncompressed: u64,
    slab_size: usize,
    in_buf: Vec<u8>,
    in_pos: usize,
    inflater: Option<Decompress>,
    pending: Option<SlabFuture>,
}

impl<R: ReadAt + 'static> EntryReader<R> {
    pub(crate) fn new(
        source: Arc<R>,
        method: CompressionMethod,
        data_offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Self {
        let inflater = match method {
            // Raw deflate stream, no zlib header inside ZIP containers.
            CompressionMethod::Deflate => Some(Decompress::new(false)),
            _ => None,
        };
        Self {
            source,
            method,
            next_offset: data_offset,
            remaining_compressed: compressed_size,
            remaining_uncompressed: uncompressed_size,
            slab_size: DEFAULT_SLAB_SIZE,
            in_buf: Vec::new(),
            in_pos: 0,
            inflater,
            pending: None,
        }
    }

    /// Override the compressed read slab size (mainly for tests).
    pub fn with_slab_size(mut self, slab_size: usize) -> Self {
        self.slab_size = slab_size.max(1);
        self
    }

    /// Uncompressed bytes not yet delivered to the consumer.
    pub fn remaining(&self) -> u64 {
        self.remaining_uncompressed
    }

    /// Serve decompressed bytes from the current slab. Returns the number
    /// of bytes written into `buf`, or `None` when the slab is exhausted
    /// and a refill is needed.
    fn serve(&mut self, buf: &mut ReadBuf<'_>) -> io::Result<Option<usize>> {
        match self.method {
            CompressionMethod::Stored => {
                if self.in_pos >= self.in_buf.len() {
                    return Ok(None);
                }
                let available = self.in_buf.len() - self.in_pos;
                let n = buf
                    .remaining()
                    .min(available)
                    .min(self.remaining_uncompressed as usize);
                buf.put_slice(&self.in_buf[self.in_pos..self.in_pos + n]);
                self.in_pos += n;
                self.remaining_uncompressed -= n as u64;
                Ok(Some(n))
            }
            CompressionMethod::Deflate => {
                let input_exhausted = self.in_pos >= self.in_buf.len();
                if input_exhausted && self.remaining_compressed > 0 {
                    return Ok(None);
                }
                let inflater = self
                    .inflater
                    .as_mut()
                    .expect("deflate reader always carries an inflater");

                let flush = if input_exhausted {
                    FlushDecompress::Finish
                } else {
                    FlushDecompress::None
                };
                let before_in = inflater.total_in();
                let before_out = inflater.total_out();
                // Never inflate past the declared size: a lying header must
                // not turn into unbounded output.
                let out = buf.initialize_unfilled();
                let cap = out.len().min(self.remaining_uncompressed as usize);
                let status = inflater
                    .decompress(&self.in_buf[self.in_pos..], &mut out[..cap], flush)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                let consumed = (inflater.total_in() - before_in) as usize;
                let produced = (inflater.total_out() - before_out) as usize;
                self.in_pos += consumed;
                buf.advance(produced);
                self.remaining_uncompressed =
                    self.remaining_uncompressed.saturating_sub(produced as u64);

                if matches!(status, Status::StreamEnd) && self.remaining_uncompressed > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "entry ended short of its declared size",
                    ));
                }
                if produced == 0 && consumed == 0 && input_exhausted {
                    // Finish made no progress on an empty tail: truncated data.
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated deflate stream",
                    ));
                }
                Ok(Some(produced))
            }
            CompressionMethod::Unknown(method) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported compression method {method}"),
            )),
        }
    }

    fn start_refill(&mut self) -> SlabFuture {
        let len = self.slab_size.min(self.remaining_compressed as usize);
        let source = Arc::clone(&self.source);
        let offset = self.next_offset;
        Box::pin(async move {
            let mut slab = vec![0u8; len];
            source.read_exact_at(offset, &mut slab).await?;
            Ok(slab)
        })
    }
}

impl<R: ReadAt + 'static> AsyncRead for EntryReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.remaining_uncompressed == 0 || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            match this.serve(buf) {
                Err(e) => return Poll::Ready(Err(e)),
                Ok(Some(0)) => continue,
                Ok(Some(_)) => return Poll::Ready(Ok(())),
                Ok(None) => {}
            }

            // Slab exhausted; pull the next one.
            if this.remaining_compressed == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "entry data ended before its declared size",
                )));
            }
            if this.pending.is_none() {
                let fut = this.start_refill();
                this.pending = Some(fut);
            }
            match this.pending.as_mut().map(|f| f.as_mut().poll(cx)) {
                Some(Poll::Pending) => return Poll::Pending,
                Some(Poll::Ready(Err(e))) => {
                    this.pending = None;
                    return Poll::Ready(Err(e));
                }
                Some(Poll::Ready(Ok(slab))) => {
                    this.pending = None;
                    this.next_offset += slab.len() as u64;
                    this.remaining_compressed -= slab.len() as u64;
                    this.in_buf = slab;
                    this.in_pos = 0;
                }
                None => unreachable!("pending future installed above"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use flate2::Compression;
    use std::io::Write;
    use tokio::io::AsyncReadExt;

    fn stored_reader(data: &[u8], slab: usize) -> EntryReader<MemoryReader> {
        EntryReader::new(
            Arc::new(MemoryReader::new(data.to_vec())),
            CompressionMethod::Stored,
            0,
            data.len() as u64,
            data.len() as u64,
        )
        .with_slab_size(slab)
    }

    fn deflate_payload(data: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn stored_round_trip_across_slabs() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = stored_reader(&data, 17);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn deflate_round_trip_across_slabs() {
        let data = b"the quick brown fox jumps over the lazy dog ".repeat(500);
        let compressed = deflate_payload(&data);
        let mut reader = EntryReader::new(
            Arc::new(MemoryReader::new(compressed.clone())),
            CompressionMethod::Deflate,
            0,
            compressed.len() as u64,
            data.len() as u64,
        )
        .with_slab_size(64);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn zero_length_entry_is_immediate_eof() {
        let mut reader = stored_reader(&[], 16);
        let mut out = Vec::new();
        assert_eq!(reader.read_to_end(&mut out).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn truncated_stored_entry_errors() {
        // Declared uncompressed size exceeds the backing data.
        let mut reader = EntryReader::new(
            Arc::new(MemoryReader::new(b"abc".to_vec())),
            CompressionMethod::Stored,
            0,
            3,
            10,
        );
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn corrupt_deflate_stream_errors() {
        let garbage = vec![0xFFu8; 128];
        let mut reader = EntryReader::new(
            Arc::new(MemoryReader::new(garbage.clone())),
            CompressionMethod::Deflate,
            0,
            garbage.len() as u64,
            1024,
        );
        let mut out = Vec::new();
        assert!(reader.read_to_end(&mut out).await.is_err());
    }
}
