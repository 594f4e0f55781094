//! Memory ceiling accounting.
//!
//! The [`MemoryMonitor`] is the leaf every other component consults: it
//! combines a live probe of process memory with an in-flight counter of
//! bytes the core itself is currently holding, and evaluates the "limit
//! exceeded" predicate against a configured ceiling.
//!
//! The probe is injected rather than global so tests can drive ceiling
//! breaches deterministically and embedders can supply their own notion of
//! "current usage".

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, MemoryPhase, Result};

/// Source of the process's current resident memory usage, in bytes.
pub trait MemoryProbe: Send + Sync + std::fmt::Debug {
    fn current_usage(&self) -> u64;
}

/// Default probe: resident set size of the current process.
///
/// Reads `/proc/self/statm` on Linux. On platforms without a cheap RSS
/// source it reports zero, in which case only the monitor's own in-flight
/// accounting contributes to the usage figure.
#[derive(Debug, Default)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn current_usage(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
                // Second field is resident pages.
                if let Some(resident) = statm.split_whitespace().nth(1) {
                    if let Ok(pages) = resident.parse::<u64>() {
                        return pages.saturating_mul(page_size());
                    }
                }
            }
            0
        }

        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    // statm accounting only needs to be approximate; 4 KiB pages everywhere
    // we run.
    4096
}

/// A fixed-value probe for tests and embedders with external accounting.
#[derive(Debug)]
pub struct FixedProbe(pub u64);

impl MemoryProbe for FixedProbe {
    fn current_usage(&self) -> u64 {
        self.0
    }
}

/// Per-processor memory budget: a ceiling plus a live usage reading.
///
/// Usage is `probe.current_usage() + in_flight`, where `in_flight` counts
/// bytes currently held by reservations taken out against this monitor.
/// Exceeding the ceiling terminates the in-flight operation with a typed
/// error; it never corrupts or partially commits state.
#[derive(Debug)]
pub struct MemoryMonitor {
    ceiling: Option<u64>,
    in_flight: AtomicU64,
    probe: Arc<dyn MemoryProbe>,
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl MemoryMonitor {
    /// Monitor with no ceiling: checks always pass, accounting still runs.
    pub fn unlimited() -> Self {
        Self {
            ceiling: None,
            in_flight: AtomicU64::new(0),
            probe: Arc::new(ProcessMemoryProbe),
        }
    }

    /// Monitor enforcing `ceiling` bytes against the default process probe.
    pub fn with_ceiling(ceiling: u64) -> Self {
        Self {
            ceiling: Some(ceiling),
            in_flight: AtomicU64::new(0),
            probe: Arc::new(ProcessMemoryProbe),
        }
    }

    /// Monitor with an injected probe.
    pub fn with_probe(ceiling: Option<u64>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            ceiling,
            in_flight: AtomicU64::new(0),
            probe,
        }
    }

    /// Configured ceiling, if any.
    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    /// Current usage: probe reading plus reserved in-flight bytes.
    pub fn usage(&self) -> u64 {
        self.probe
            .current_usage()
            .saturating_add(self.in_flight.load(Ordering::Relaxed))
    }

    /// Bytes of headroom left under the ceiling (`u64::MAX` if unlimited).
    pub fn headroom(&self) -> u64 {
        match self.ceiling {
            Some(ceiling) => ceiling.saturating_sub(self.usage()),
            None => u64::MAX,
        }
    }

    /// Evaluate the limit predicate, tagging a breach with `phase`.
    pub fn check(&self, phase: MemoryPhase) -> Result<()> {
        self.check_additional(0, phase)
    }

    /// As [`check`](Self::check), but as if `additional` more bytes were
    /// already held. Used before an allocation to fail ahead of it.
    pub fn check_additional(&self, additional: u64, phase: MemoryPhase) -> Result<()> {
        let Some(ceiling) = self.ceiling else {
            return Ok(());
        };
        let usage = self.usage().saturating_add(additional);
        if usage > ceiling {
            tracing::debug!(usage, ceiling, %phase, "memory ceiling breached");
            return Err(Error::MemoryLimitExceeded {
                phase,
                usage,
                ceiling,
            });
        }
        Ok(())
    }

    /// Reserve `bytes` against this monitor, releasing on drop.
    ///
    /// The reservation can grow as a buffer grows; all paths out of a
    /// processor (success, error, cancellation by drop) release it.
    pub fn reserve(self: &Arc<Self>, bytes: u64) -> MemoryReservation {
        self.in_flight.fetch_add(bytes, Ordering::Relaxed);
        MemoryReservation {
            monitor: Arc::clone(self),
            bytes,
        }
    }
}

/// RAII guard over in-flight bytes charged to a [`MemoryMonitor`].
#[derive(Debug)]
pub struct MemoryReservation {
    monitor: Arc<MemoryMonitor>,
    bytes: u64,
}

impl MemoryReservation {
    /// Grow the reservation by `additional` bytes.
    pub fn grow(&mut self, additional: u64) {
        self.monitor
            .in_flight
            .fetch_add(additional, Ordering::Relaxed);
        self.bytes = self.bytes.saturating_add(additional);
    }

    /// Bytes currently held by this reservation.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.monitor
            .in_flight
            .fetch_sub(self.bytes, Ordering::Relaxed);
    }
}
