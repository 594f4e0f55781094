//! # zipcap
//!
//! A memory-bounded streaming ZIP extraction library.
//!
//! This library extracts ZIP archives under an explicit memory ceiling. The
//! central directory is parsed from the end of the file with random-access
//! reads, entries are filtered before any payload byte is read, and each
//! surviving entry is routed to a processor by size: small entries are
//! materialized whole, large entries are split into bounded chunks, and
//! directories cost nothing. Every allocation along the way is accounted
//! against the configured ceiling.
//!
//! ## Features
//!
//! - Streaming extraction with a hard, per-extraction memory ceiling
//! - Support for ZIP64 format (archives larger than 4GB)
//! - Support for STORED (uncompressed) and DEFLATE compression methods
//! - Glob-based include/exclude filtering with a built-in security screen
//!   against path traversal and disguised entry names
//! - Chunked processing with content-aware chunk sizing and buffer pooling
//! - Backpressure-aware stream adapters for slow consumers
//! - Sequential or bounded-parallel batch processing with preserved order
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use zipcap::{ExtractOptions, FilterConfig, StreamingZipExtractor};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = ExtractOptions {
//!         max_memory: Some(64 * 1024 * 1024),
//!         filter: Some(FilterConfig::new().include_patterns(["**/*.txt"])),
//!         ..Default::default()
//!     };
//!     let extractor = StreamingZipExtractor::open_path(Path::new("archive.zip"), options)?;
//!
//!     for entry in extractor.extract_streams().await? {
//!         println!("{} ({} bytes)", entry.name(), entry.size());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod backpressure;
pub mod chunked;
pub mod cli;
pub mod entry;
pub mod error;
pub mod extract;
pub mod filter;
pub mod io;
pub mod memory;
pub mod processor;
pub mod progress;
pub mod zip;

pub use backpressure::{BackpressureHandler, ControlledWriter, ThrottledReader};
pub use chunked::{ChunkOptions, ChunkedProcessor, ProcessingResult};
pub use cli::Cli;
pub use entry::StreamEntry;
pub use error::{Error, MemoryPhase, Result};
pub use extract::{ExtractOptions, ExtractedEntry, Payload, StreamingZipExtractor};
pub use filter::{EntryFilter, FilterConfig};
pub use io::{LocalFileReader, MemoryReader, ReadAt};
pub use memory::{MemoryMonitor, MemoryReservation};
pub use processor::{BatchOptions, FailurePolicy, MemoryEfficientProcessor};
pub use progress::{ProgressEvent, ProgressSink, SharedProgressSink};
pub use zip::{CompressionMethod, ZipEntry, ZipParser};
