//! Streaming archive extraction under a memory ceiling.
//!
//! [`StreamingZipExtractor`] is the coordinating root: it opens the
//! container, applies the entry filter before any payload byte is touched,
//! enforces the pre-flight memory guard and the entry-count guard, and
//! routes each surviving entry to a processor by size: small entries are
//! materialized whole while large entries go through chunked processing.
//! Directories bypass both with zero cost.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::backpressure::BackpressureHandler;
use crate::chunked::{ChunkOptions, ChunkedProcessor, ProcessingResult};
use crate::entry::StreamEntry;
use crate::error::{Error, MemoryPhase, Result};
use crate::filter::{EntryFilter, FilterConfig};
use crate::io::{LocalFileReader, MemoryReader, ReadAt};
use crate::memory::{MemoryMonitor, MemoryProbe};
use crate::processor::{BatchOptions, FailurePolicy, MemoryEfficientProcessor};
use crate::progress::{ProgressEvent, SharedProgressSink};

/// Ceiling on entries per archive unless the caller overrides it.
/// Bounds directory-bomb style archives long before payload I/O.
pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

/// Entries at or below this size are materialized whole; larger ones are
/// chunked.
pub const DEFAULT_SMALL_ENTRY_LIMIT: u64 = 10 * 1024 * 1024;

/// Per-entry hook awaited for each entry the extractor yields.
#[async_trait]
pub trait EntryHook: Send + Sync {
    async fn on_entry(&self, name: &str, size: u64, is_directory: bool) -> Result<()>;
}

/// Caller-supplied options. Everything is optional; defaults are safe.
#[derive(Default, Clone)]
pub struct ExtractOptions {
    /// Hard memory ceiling in bytes. Unset means unlimited.
    pub max_memory: Option<u64>,
    /// High-water-mark handed to downstream backpressure stages.
    pub high_water_mark: Option<usize>,
    /// Entry-count guard; defaults to [`DEFAULT_MAX_ENTRIES`].
    pub max_entries: Option<u64>,
    /// Chunk size for the chunked path.
    pub chunk_size: Option<usize>,
    pub parallel: bool,
    pub parallel_workers: usize,
    pub on_failure: FailurePolicy,
    /// Entry filter policy; the security screen applies even when unset.
    pub filter: Option<FilterConfig>,
    pub progress: Option<SharedProgressSink>,
    pub on_entry: Option<Arc<dyn EntryHook>>,
    /// Size threshold for routing; defaults to
    /// [`DEFAULT_SMALL_ENTRY_LIMIT`].
    pub small_entry_limit: Option<u64>,
    /// Injected memory probe, mainly for tests.
    pub memory_probe: Option<Arc<dyn MemoryProbe>>,
}

/// One extracted entry in archive order.
#[derive(Debug)]
pub struct ExtractedEntry {
    pub name: String,
    pub size: u64,
    pub is_directory: bool,
    pub payload: Payload,
}

/// Payload produced by the size-based routing policy.
#[derive(Debug)]
pub enum Payload {
    /// Directory entries carry no bytes.
    Directory,
    /// Small entry, materialized whole.
    Whole(Vec<u8>),
    /// Large entry, split into bounded chunks.
    Chunks(ProcessingResult),
    /// Entry failed under [`FailurePolicy::Skip`].
    Failed(Error),
}

/// Coordinating extractor over one archive source.
///
/// Owns the archive handle (via `Arc`), which is released on every exit
/// path when the extractor and all outstanding entry streams drop.
pub struct StreamingZipExtractor<R: ReadAt + 'static> {
    parser: Arc<crate::zip::ZipParser<R>>,
    monitor: Arc<MemoryMonitor>,
    filter: EntryFilter,
    options: ExtractOptions,
}

impl<R: ReadAt + 'static> std::fmt::Debug for StreamingZipExtractor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingZipExtractor")
            .field("source_size", &self.parser.source_size())
            .field("monitor", &self.monitor)
            .finish_non_exhaustive()
    }
}

impl StreamingZipExtractor<LocalFileReader> {
    /// Extractor over an archive file on disk.
    pub fn open_path(path: &Path, options: ExtractOptions) -> Result<Self> {
        let reader = LocalFileReader::new(path).map_err(|e| Error::ArchiveOpen {
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(Self::new(Arc::new(reader), options))
    }
}

impl StreamingZipExtractor<MemoryReader> {
    /// Extractor over an in-memory archive buffer.
    pub fn open_buffer(data: impl Into<bytes::Bytes>, options: ExtractOptions) -> Self {
        Self::new(Arc::new(MemoryReader::new(data.into())), options)
    }
}

impl<R: ReadAt + Send + Sync + 'static> StreamingZipExtractor<R> {
    pub fn new(source: Arc<R>, options: ExtractOptions) -> Self {
        let monitor = match (&options.memory_probe, options.max_memory) {
            (Some(probe), ceiling) => {
                Arc::new(MemoryMonitor::with_probe(ceiling, Arc::clone(probe)))
            }
            (None, Some(ceiling)) => Arc::new(MemoryMonitor::with_ceiling(ceiling)),
            (None, None) => Arc::new(MemoryMonitor::unlimited()),
        };
        let filter = EntryFilter::new(options.filter.clone().unwrap_or_default());
        let parser = Arc::new(crate::zip::ZipParser::with_monitor(
            source,
            Arc::clone(&monitor),
        ));
        Self {
            parser,
            monitor,
            filter,
            options,
        }
    }

    /// The monitor enforcing this extractor's ceiling, shared with every
    /// processor it spawns.
    pub fn monitor(&self) -> Arc<MemoryMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Flow-control stage factory bound to this extractor's monitor and
    /// configured high-water-mark.
    pub fn backpressure(&self) -> BackpressureHandler {
        BackpressureHandler::new(Arc::clone(&self.monitor), self.options.high_water_mark)
    }

    /// Open the archive and yield filtered, lazily-readable entries.
    ///
    /// Guards run in order: pre-flight memory check, container open,
    /// entry-count guard, then filtering. One progress event fires per
    /// entry discovered, before filtering.
    pub async fn extract_streams(&self) -> Result<Vec<StreamEntry<R>>> {
        let started = Instant::now();
        // Fail fast if the budget is already blown; distinct from the
        // in-flight guards inside the processors.
        self.monitor.check(MemoryPhase::BeforeProcessing)?;

        let max_entries = self.options.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
        let declared = self.parser.declared_entry_count().await?;
        if declared > max_entries {
            return Err(Error::TooManyEntries {
                count: declared,
                limit: max_entries,
            });
        }

        let raw = self.parser.list_entries().await?;
        if raw.len() as u64 > max_entries {
            // The central directory can disagree with the EOCD count.
            return Err(Error::TooManyEntries {
                count: raw.len() as u64,
                limit: max_entries,
            });
        }

        if let Some(sink) = &self.options.progress {
            for i in 0..raw.len() {
                sink.on_progress(&ProgressEvent::new(
                    i as u64 + 1,
                    Some(declared),
                    self.monitor.usage(),
                    started.elapsed(),
                ));
            }
        }

        let entries: Vec<StreamEntry<R>> = raw
            .into_iter()
            .map(|meta| StreamEntry::new(meta, Arc::clone(&self.parser)))
            .collect();
        let survivors = self.filter.filter_entries(entries);
        tracing::debug!(
            declared,
            surviving = survivors.len(),
            "archive opened and filtered"
        );

        if let Some(hook) = &self.options.on_entry {
            for entry in &survivors {
                hook.on_entry(entry.name(), entry.size(), entry.is_directory())
                    .await?;
            }
        }
        Ok(survivors)
    }

    /// Extract and materialize every surviving entry, routing by size.
    pub async fn extract(&self) -> Result<Vec<ExtractedEntry>> {
        let entries = self.extract_streams().await?;
        let small_limit = self
            .options
            .small_entry_limit
            .unwrap_or(DEFAULT_SMALL_ENTRY_LIMIT);

        let processor = MemoryEfficientProcessor::new(Arc::clone(&self.monitor));
        let mut chunker = match self.options.chunk_size {
            Some(size) => ChunkedProcessor::with_chunk_size(Arc::clone(&self.monitor), size),
            None => ChunkedProcessor::new(Arc::clone(&self.monitor)),
        };

        // Split by route, remembering each entry's position so output
        // order matches archive order regardless of processing order.
        let mut results: Vec<Option<ExtractedEntry>> = Vec::new();
        results.resize_with(entries.len(), || None);
        let mut small: Vec<(usize, StreamEntry<R>)> = Vec::new();
        let mut large: Vec<(usize, StreamEntry<R>)> = Vec::new();

        for (i, entry) in entries.into_iter().enumerate() {
            if entry.is_directory() {
                results[i] = Some(ExtractedEntry {
                    name: entry.name().to_string(),
                    size: 0,
                    is_directory: true,
                    payload: Payload::Directory,
                });
            } else if entry.size() <= small_limit {
                small.push((i, entry));
            } else {
                large.push((i, entry));
            }
        }

        if !small.is_empty() {
            let batch: Vec<StreamEntry<R>> = small.iter().map(|(_, e)| e.clone()).collect();
            let outcomes = processor
                .process_entries(
                    &batch,
                    &BatchOptions {
                        parallel: self.options.parallel,
                        parallel_workers: self.options.parallel_workers,
                        on_failure: self.options.on_failure,
                        progress: self.options.progress.clone(),
                    },
                )
                .await?;
            for ((i, _), outcome) in small.iter().zip(outcomes) {
                let payload = match outcome.data {
                    Ok(data) => Payload::Whole(data),
                    Err(e) => Payload::Failed(e),
                };
                let size = match &payload {
                    Payload::Whole(data) => data.len() as u64,
                    _ => 0,
                };
                results[*i] = Some(ExtractedEntry {
                    name: outcome.name,
                    size,
                    is_directory: false,
                    payload,
                });
            }
        }

        for (i, entry) in large {
            let chunk_options = ChunkOptions {
                known_total_size: Some(entry.size()),
                content_type: None,
                progress: self.options.progress.clone(),
            };
            let outcome = chunker
                .process_entry_in_chunks(&entry, self.options.chunk_size, &chunk_options)
                .await;
            let payload = match outcome {
                Ok(result) => Payload::Chunks(result),
                Err(e) if self.options.on_failure == FailurePolicy::Skip => Payload::Failed(e),
                Err(e) => return Err(e),
            };
            let size = match &payload {
                Payload::Chunks(result) => result.total_size,
                _ => 0,
            };
            results[i] = Some(ExtractedEntry {
                name: entry.name().to_string(),
                size,
                is_directory: false,
                payload,
            });
        }

        Ok(results
            .into_iter()
            .map(|slot| slot.expect("every routed entry produces a result"))
            .collect())
    }
}
