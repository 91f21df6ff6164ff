//! Process-wide pipeline counters.
//!
//! Exposed through logs and the dashboard status endpoint. Sink counters
//! (`dropped`, `failed`) live with the sink itself.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters incremented by the flow controller.
#[derive(Debug, Default)]
pub struct TapCounters {
    /// Flows whose declarative extraction was degraded and fell back to the
    /// builtin extractor.
    pub extract_degraded: AtomicU64,
    /// Malformed stream frames skipped across all flows.
    pub stream_skipped: AtomicU64,
}

impl TapCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_degraded(&self) {
        self.extract_degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, count: u64) {
        if count > 0 {
            self.stream_skipped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn extract_degraded(&self) -> u64 {
        self.extract_degraded.load(Ordering::Relaxed)
    }

    pub fn stream_skipped(&self) -> u64 {
        self.stream_skipped.load(Ordering::Relaxed)
    }
}
