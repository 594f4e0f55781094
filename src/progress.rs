//! Progress reporting.
//!
//! Purely observational: events carry no control-flow significance, and a
//! sink that panics or blocks is the caller's problem. Components take the
//! sink as an injected interface rather than a process-wide singleton.

use std::sync::Arc;
use std::time::Duration;

/// One progress observation during a long operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// Percentage complete, 0–100. Exact when the total is known,
    /// estimated from bytes seen so far otherwise.
    pub percentage: f64,
    /// Units processed so far (bytes or entries, per operation).
    pub processed: u64,
    /// Total units, if known up front.
    pub total: Option<u64>,
    /// Memory in use when the event fired, in bytes.
    pub memory_usage: u64,
    /// Processing rate in units per second.
    pub rate: f64,
}

impl ProgressEvent {
    pub(crate) fn new(processed: u64, total: Option<u64>, memory_usage: u64, elapsed: Duration) -> Self {
        let percentage = match total {
            Some(0) => 100.0,
            Some(total) => (processed as f64 / total as f64 * 100.0).min(100.0),
            None => estimated_percentage(processed),
        };
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            processed as f64 / secs
        } else {
            0.0
        };
        Self {
            percentage,
            processed,
            total,
            memory_usage,
            rate,
        }
    }
}

/// With no known total, estimate against the next power of two of bytes
/// seen so far. Coarse, monotone within each doubling window, and honest
/// about being a guess.
fn estimated_percentage(processed: u64) -> f64 {
    if processed == 0 {
        return 0.0;
    }
    let window = processed.max(64 * 1024).next_power_of_two();
    (processed as f64 / window as f64 * 100.0).min(100.0)
}

/// Caller-supplied destination for progress events.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Shared handle to an optional sink.
pub type SharedProgressSink = Arc<dyn ProgressSink>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_percentage_with_known_total() {
        let ev = ProgressEvent::new(25, Some(100), 0, Duration::from_secs(1));
        assert_eq!(ev.percentage, 25.0);
        assert_eq!(ev.rate, 25.0);
    }

    #[test]
    fn zero_total_is_complete() {
        let ev = ProgressEvent::new(0, Some(0), 0, Duration::from_millis(1));
        assert_eq!(ev.percentage, 100.0);
    }

    #[test]
    fn unknown_total_estimates_without_exceeding_hundred() {
        let ev = ProgressEvent::new(1 << 30, None, 0, Duration::from_secs(1));
        assert!(ev.percentage > 0.0 && ev.percentage <= 100.0);
    }

    #[test]
    fn closure_is_a_sink() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |ev: &ProgressEvent| seen.lock().unwrap().push(ev.processed);
        sink.on_progress(&ProgressEvent::new(5, Some(10), 0, Duration::ZERO));
        assert_eq!(*seen.lock().unwrap(), vec![5]);
    }
}
