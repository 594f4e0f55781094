//! Random-access input sources for archive containers.
//!
//! The extraction core reads containers through [`ReadAt`], so the same
//! parsing and streaming code serves a file on disk or an in-memory buffer.
//! Implementations must be cheap to share: entry streams hold the source
//! behind an `Arc` and issue positional reads concurrently.

mod buffer;
mod local;

pub use buffer::MemoryReader;
pub use local::LocalFileReader;

use std::io;

use async_trait::async_trait;

/// Trait for random access reading from a data source.
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer.
    ///
    /// May return fewer bytes than requested; callers needing a full buffer
    /// use [`read_exact_at`](Self::read_exact_at).
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Get the total size of the data source.
    fn size(&self) -> u64;

    /// Read until `buf` is full, failing on premature end of input.
    async fn read_exact_at(&self, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.read_at(offset, buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected end of archive data",
                ));
            }
            offset += n as u64;
            buf = &mut buf[n..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_exact_at_fails_past_end() {
        let reader = MemoryReader::new(vec![1, 2, 3]);
        let mut buf = [0u8; 5];
        let err = reader.read_exact_at(0, &mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn read_exact_at_fills_buffer() {
        let reader = MemoryReader::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];
        reader.read_exact_at(1, &mut buf).await.unwrap();
        assert_eq!(buf, [2, 3, 4]);
    }
}
