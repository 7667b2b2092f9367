//! In-process metric sinks
//!
//! Counters and histograms are plain atomics so they can be updated from any
//! worker without coordination. Gauges (queue size, oldest item age, worker
//! counts) are not stored here; the service computes them on demand when a
//! [`MetricsSnapshot`] is taken.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Samples kept for percentile estimates
const RECENT_SAMPLES: usize = 1024;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.increment_by(1);
    }

    pub fn increment_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Distribution of recorded values
///
/// Count, sum, min and max cover every sample ever recorded; percentiles are
/// estimated from the most recent samples only.
#[derive(Debug)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    min: AtomicU64,
    max: AtomicU64,
    recent: Mutex<VecDeque<u64>>,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_SAMPLES)),
        }
    }

    /// Record a sample
    pub fn record(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);

        let mut recent = self.recent.lock();
        if recent.len() == RECENT_SAMPLES {
            recent.pop_front();
        }
        recent.push_back(value);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Smallest sample, `None` before the first record
    pub fn min(&self) -> Option<u64> {
        match self.min.load(Ordering::Relaxed) {
            u64::MAX if self.count() == 0 => None,
            min => Some(min),
        }
    }

    /// Largest sample, `None` before the first record
    pub fn max(&self) -> Option<u64> {
        (self.count() > 0).then(|| self.max.load(Ordering::Relaxed))
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            return 0.0;
        }
        self.sum() as f64 / count as f64
    }

    /// Percentile (0.0 to 1.0) over recent samples
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let mut samples: Vec<u64> = self.recent.lock().iter().copied().collect();
        if samples.is_empty() {
            return None;
        }
        samples.sort_unstable();
        let idx = ((samples.len() as f64 * p.clamp(0.0, 1.0)) as usize).min(samples.len() - 1);
        Some(samples[idx])
    }

    pub fn summary(&self) -> HistogramSummary {
        HistogramSummary {
            count: self.count(),
            sum: self.sum(),
            min: self.min(),
            max: self.max(),
            mean: self.mean(),
            p50: self.percentile(0.50),
            p99: self.percentile(0.99),
        }
    }
}

/// Point-in-time view of a [`Histogram`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: u64,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub mean: f64,
    pub p50: Option<u64>,
    pub p99: Option<u64>,
}

/// Metric sinks shared by the pool, the recovery task and the service
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    /// Items accepted through ingestion (local, remote and recovered)
    pub submitted: Counter,
    /// Items whose handler returned `Ok`
    pub completed: Counter,
    /// Items whose handler returned `Err` or panicked
    pub failed: Counter,
    /// Submissions refused by a saturated pool
    pub rejected: Counter,
    /// Recovery cycles that ran to completion
    pub recovery_cycles: Counter,
    /// Items resubmitted by recovery
    pub recovered_items: Counter,
    /// Items flushed per recovery cycle
    pub recovery_flushed: Histogram,
    /// Duration of recovery cycles in milliseconds
    pub recovery_duration_ms: Histogram,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine stored metrics with on-demand gauges
    pub fn snapshot(&self, gauges: Gauges) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.get(),
            completed: self.completed.get(),
            failed: self.failed.get(),
            rejected: self.rejected.get(),
            recovery_cycles: self.recovery_cycles.get(),
            recovered_items: self.recovered_items.get(),
            recovery_flushed: self.recovery_flushed.summary(),
            recovery_duration_ms: self.recovery_duration_ms.summary(),
            gauges,
        }
    }
}

/// Values computed at snapshot time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gauges {
    pub queue_size: usize,
    pub oldest_item_age_millis: Option<i64>,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub buffered: usize,
    /// Callers waiting on the result of a locally submitted item
    pub futures_waiting: usize,
}

/// Serializable view of every dispatch metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub rejected: u64,
    pub recovery_cycles: u64,
    pub recovered_items: u64,
    pub recovery_flushed: HistogramSummary,
    pub recovery_duration_ms: HistogramSummary,
    #[serde(flatten)]
    pub gauges: Gauges,
}
