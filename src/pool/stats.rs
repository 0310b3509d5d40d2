//! Pool statistics

use crate::core::{ErrorKind, ImageFormat};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(feature = "metrics")]
use dashmap::DashMap;

/// Point-in-time view of a pool
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolStats {
    /// Target number of units
    pub capacity: usize,
    /// Units that are starting, idle, busy or draining
    pub live_units: usize,
    /// Units currently idle
    pub idle_units: usize,
    /// Tasks currently assigned to a unit
    pub running_tasks: usize,
    /// Tasks waiting in the queue
    pub queued_tasks: usize,
    /// Tasks accepted by `submit`
    pub tasks_submitted: u64,
    /// Tasks that produced an output
    pub tasks_completed: u64,
    /// Tasks the codec rejected
    pub tasks_failed: u64,
    /// Tasks cancelled by their caller
    pub tasks_cancelled: u64,
    /// Tasks that hit their deadline
    pub tasks_timed_out: u64,
    /// Tasks lost to a unit crash
    pub tasks_crashed: u64,
    /// Tasks abandoned by closing the pool
    pub tasks_abandoned: u64,
    /// Units ever started
    pub units_started: u64,
    /// Units retired or lost
    pub units_retired: u64,
    /// Average codec time of finished tasks
    pub avg_processing_time: Duration,
}

impl PoolStats {
    /// Tasks that reached a final state
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_completed
            + self.tasks_failed
            + self.tasks_cancelled
            + self.tasks_timed_out
            + self.tasks_crashed
            + self.tasks_abandoned
    }

    /// Share of finished tasks that completed, in percent
    pub fn success_rate(&self) -> f64 {
        let finished = self.tasks_finished();
        if finished == 0 {
            100.0
        } else {
            (self.tasks_completed as f64 / finished as f64) * 100.0
        }
    }
}

/// Counters for one output format
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormatStats {
    /// Conversions that completed
    pub completed: u64,
    /// Conversions that failed for any reason
    pub failed: u64,
    /// Bytes received
    pub input_bytes: u64,
    /// Bytes produced
    pub output_bytes: u64,
}

/// Lock-free counters updated by submitters and units
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    crashed: AtomicU64,
    abandoned: AtomicU64,
    units_started: AtomicU64,
    units_retired: AtomicU64,
    processed: AtomicU64,
    processing_time_us: AtomicU64,
    #[cfg(feature = "metrics")]
    per_format: DashMap<ImageFormat, FormatStats>,
}

impl PoolCounters {
    pub(crate) fn record_submission(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unit_started(&self) {
        self.units_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unit_retired(&self) {
        self.units_retired.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one codec run, whatever its outcome
    pub(crate) fn record_processing(&self, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.processing_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_completed(
        &self,
        _format: ImageFormat,
        _input_bytes: usize,
        _output_bytes: usize,
    ) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            let mut entry = self.per_format.entry(_format).or_default();
            entry.completed += 1;
            entry.input_bytes += _input_bytes as u64;
            entry.output_bytes += _output_bytes as u64;
        }
    }

    /// Count a failed task under the counter for its kind
    pub(crate) fn record_failure(&self, kind: ErrorKind, _format: ImageFormat) {
        let counter = match kind {
            ErrorKind::Codec | ErrorKind::Validation => &self.failed,
            ErrorKind::Cancelled => &self.cancelled,
            ErrorKind::Timeout => &self.timed_out,
            ErrorKind::WorkerCrash => &self.crashed,
            ErrorKind::PoolClosed => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        {
            self.per_format.entry(_format).or_default().failed += 1;
        }
    }

    pub(crate) fn tasks_submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Fill the counter part of a snapshot
    pub(crate) fn fill(&self, stats: &mut PoolStats) {
        stats.tasks_submitted = self.submitted.load(Ordering::Relaxed);
        stats.tasks_completed = self.completed.load(Ordering::Relaxed);
        stats.tasks_failed = self.failed.load(Ordering::Relaxed);
        stats.tasks_cancelled = self.cancelled.load(Ordering::Relaxed);
        stats.tasks_timed_out = self.timed_out.load(Ordering::Relaxed);
        stats.tasks_crashed = self.crashed.load(Ordering::Relaxed);
        stats.tasks_abandoned = self.abandoned.load(Ordering::Relaxed);
        stats.units_started = self.units_started.load(Ordering::Relaxed);
        stats.units_retired = self.units_retired.load(Ordering::Relaxed);

        let processed = self.processed.load(Ordering::Relaxed);
        let total_us = self.processing_time_us.load(Ordering::Relaxed);
        stats.avg_processing_time = if processed > 0 {
            Duration::from_micros(total_us / processed)
        } else {
            Duration::ZERO
        };
    }

    /// Counters for one format
    #[cfg(feature = "metrics")]
    pub(crate) fn format_stats(&self, format: ImageFormat) -> FormatStats {
        self.per_format
            .get(&format)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}
