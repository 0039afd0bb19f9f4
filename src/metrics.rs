//! Cumulative counters, token sums, and the bounded latency window.
//!
//! Grounded on `state::TunnelStats`: a ring buffer of recent samples plus a
//! snapshot method that sorts a cloned copy to derive percentile/min/max/avg.
//! Unlike `TunnelStats`, the counters here are plain fields behind the
//! scheduler's single mutex rather than independent atomics — spec.md §5
//! requires gauges and counters to be read as one consistent snapshot
//! together with `active`/`queued`, which atomics alone can't guarantee.

use std::collections::VecDeque;

use serde::Serialize;

/// Bound on the latency window (spec.md §3).
const LATENCY_WINDOW_CAP: usize = 1000;

/// Counters, token sums, and the latency ring buffer. Lives inside the
/// scheduler's state struct, guarded by the same mutex as the queue and
/// active count.
#[derive(Debug, Default)]
pub struct MetricsState {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub queue_rejected: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    latency_window: VecDeque<u64>,
}

impl MetricsState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed request: append to the latency window (evicting
    /// the oldest sample past the cap) and add non-zero token counts.
    pub fn record_completed(&mut self, elapsed_ms: u64, input_tokens: Option<u64>, output_tokens: Option<u64>) {
        self.completed += 1;
        if self.latency_window.len() >= LATENCY_WINDOW_CAP {
            self.latency_window.pop_front();
        }
        self.latency_window.push_back(elapsed_ms);
        if let Some(t) = input_tokens.filter(|&t| t > 0) {
            self.input_tokens += t;
        }
        if let Some(t) = output_tokens.filter(|&t| t > 0) {
            self.output_tokens += t;
        }
    }

    pub fn record_failed(&mut self) {
        self.failed += 1;
    }

    pub fn record_timed_out(&mut self) {
        self.timed_out += 1;
    }

    pub fn record_queue_rejected(&mut self) {
        self.queue_rejected += 1;
    }

    /// Derive min/avg/max/p95 from the current latency window. All four are
    /// `0` when the window is empty (spec.md §4.3).
    pub fn latency_summary(&self) -> LatencySummary {
        if self.latency_window.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted: Vec<u64> = self.latency_window.iter().copied().collect();
        sorted.sort_unstable();
        let n = sorted.len();
        let sum: u64 = sorted.iter().sum();
        #[allow(clippy::cast_precision_loss)]
        let avg = (sum as f64 / n as f64).round() as u64;
        let p95_idx = ((n as f64) * 0.95).floor() as usize;
        let p95 = sorted[p95_idx.min(n - 1)];
        LatencySummary {
            min: sorted[0],
            avg,
            max: sorted[n - 1],
            p95,
        }
    }
}

/// Derived latency statistics over the current window.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LatencySummary {
    pub min: u64,
    pub avg: u64,
    pub max: u64,
    pub p95: u64,
}

/// Snapshot returned by `Scheduler::snapshot_metrics` (spec.md §3).
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub queue_rejected: u64,
    pub active: usize,
    pub queued: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub latency: LatencySummary,
}
