//! Archive entries as exposed to the processing core.

use std::sync::Arc;

use crate::error::Result;
use crate::filter::{AsEntryInfo, EntryInfo};
use crate::io::ReadAt;
use crate::zip::{EntryReader, ZipEntry, ZipParser};

/// One archive member with a lazily-opened payload stream.
///
/// Metadata comes straight from the central directory and is untrusted.
/// The payload is opened on demand and each opened stream is
/// single-consumer; re-reading an entry means calling
/// [`open`](StreamEntry::open) again.
pub struct StreamEntry<R: ReadAt> {
    meta: ZipEntry,
    parser: Arc<ZipParser<R>>,
}

impl<R: ReadAt> std::fmt::Debug for StreamEntry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEntry")
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl<R: ReadAt> Clone for StreamEntry<R> {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta.clone(),
            parser: Arc::clone(&self.parser),
        }
    }
}

impl<R: ReadAt + 'static> StreamEntry<R> {
    pub(crate) fn new(meta: ZipEntry, parser: Arc<ZipParser<R>>) -> Self {
        Self { meta, parser }
    }

    /// Raw entry name as stored in the archive. Untrusted.
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Declared uncompressed size. Untrusted; streaming never allocates
    /// based on it alone.
    pub fn size(&self) -> u64 {
        if self.meta.is_directory {
            0
        } else {
            self.meta.uncompressed_size
        }
    }

    pub fn is_directory(&self) -> bool {
        self.meta.is_directory
    }

    pub fn is_file(&self) -> bool {
        !self.meta.is_directory
    }

    /// Full central-directory metadata.
    pub fn metadata(&self) -> &ZipEntry {
        &self.meta
    }

    /// Open a fresh single-consumer stream over the payload.
    pub async fn open(&self) -> Result<EntryReader<R>> {
        self.parser.open_entry(&self.meta).await
    }
}

impl<R: ReadAt + 'static> AsEntryInfo for StreamEntry<R> {
    fn entry_info(&self) -> EntryInfo<'_> {
        EntryInfo {
            name: &self.meta.name,
            size: self.size(),
            is_directory: self.meta.is_directory,
        }
    }
}
