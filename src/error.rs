//! Typed error taxonomy for the extraction core.
//!
//! Every failure mode a caller can meaningfully react to gets its own
//! variant. Per-entry failures (`MemoryLimitExceeded`, `StreamProcessing`)
//! are fatal for the current entry/operation only; `ArchiveOpen` and
//! `TooManyEntries` are fatal for the whole call. Filter rejections are
//! never errors: a malicious archive producing rejections is an expected
//! condition, surfaced only as entries missing from the filtered output.

use std::io;

use thiserror::Error;

/// Which guard tripped a memory-ceiling breach.
///
/// Distinguishing the phases lets operators tell whether an archive was
/// rejected outright or ran out of budget partway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPhase {
    /// The pre-flight check failed before any byte was read.
    BeforeProcessing,
    /// The ceiling was breached while a stream was being drained.
    DuringProcessing,
}

impl std::fmt::Display for MemoryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryPhase::BeforeProcessing => f.write_str("before processing"),
            MemoryPhase::DuringProcessing => f.write_str("during processing"),
        }
    }
}

/// Errors produced by the extraction core.
#[derive(Debug, Error)]
pub enum Error {
    /// The container could not be parsed (bad signature, truncated header,
    /// empty file). Fatal; the core never retries.
    #[error("failed to open archive: {reason}")]
    ArchiveOpen { reason: String },

    /// The entry-count guard tripped, bounding directory-bomb archives.
    #[error("archive has too many entries: {count} (limit {limit})")]
    TooManyEntries { count: u64, limit: u64 },

    /// The configured memory ceiling was breached.
    #[error("memory limit exceeded {phase}: {usage} bytes in use, ceiling {ceiling}")]
    MemoryLimitExceeded {
        phase: MemoryPhase,
        usage: u64,
        ceiling: u64,
    },

    /// An I/O failure surfaced by the underlying stream, wrapping the cause.
    #[error("stream processing failed: {0}")]
    StreamProcessing(#[source] io::Error),
}

impl Error {
    pub(crate) fn archive_open(reason: impl Into<String>) -> Self {
        Error::ArchiveOpen {
            reason: reason.into(),
        }
    }

    /// True if this is a memory-ceiling breach (either phase).
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, Error::MemoryLimitExceeded { .. })
    }

    /// Recover a typed error smuggled through a stream's `io::Error` channel.
    ///
    /// Throttled readers and entry streams can only fail through
    /// `io::Error`; a ceiling breach inside them wraps an [`Error`] as the
    /// inner cause. This unwraps it so batch callers see the original
    /// variant instead of a generic `StreamProcessing`.
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|e| e.is::<Error>()) {
            // Checked above, downcast cannot fail.
            match err.into_inner().map(|e| e.downcast::<Error>()) {
                Some(Ok(inner)) => return *inner,
                Some(Err(e)) => return Error::StreamProcessing(io::Error::other(e)),
                None => unreachable!(),
            }
        }
        Error::StreamProcessing(err)
    }

    /// Wrap this error for propagation through a stream's error channel.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
