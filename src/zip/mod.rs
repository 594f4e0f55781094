//! ZIP container access.
//!
//! This module is the boundary the extraction core consumes from the ZIP
//! format: it turns a random-access source into entry metadata plus a
//! readable byte stream per entry. Everything above it (filtering, memory
//! budgets, chunking, backpressure) is format-agnostic.
//!
//! ## Parsing strategy
//!
//! ZIP files are designed to be read from the end:
//! 1. Find the End of Central Directory (EOCD) at the file's end
//! 2. If ZIP64, read the ZIP64 EOCD for large-archive support
//! 3. Read the Central Directory to get metadata for all entries
//! 4. For extraction, resolve each entry's Local File Header to find its data
//!
//! Entry payloads are never materialized here: [`EntryReader`] streams
//! STORED data straight from the source and inflates DEFLATE data
//! incrementally, one bounded slab at a time.
//!
//! ## Supported
//!
//! - Standard ZIP format and ZIP64 extensions
//! - STORED and DEFLATE entries
//!
//! ## Not supported
//!
//! - Encryption (encrypted entries fail at open time)
//! - Multi-disk archives

mod parser;
mod stream;
mod structures;

pub use parser::ZipParser;
pub use stream::EntryReader;
pub use structures::{CompressionMethod, ZipEntry};
