//! Tracing integration for observability.
//!
//! Available with the `tracing` feature. Each task captures the submitter's
//! current span, and the unit that runs it enters that span around the codec
//! call, so codec events nest under the request that caused them. Units run
//! inside a `unit` span of their own.
//!
//! The [`metrics`] functions emit trace events shaped for metrics bridges
//! (for example tracing-opentelemetry): `counter.*`, `gauge.*` and
//! `histogram.*` fields.
//!
//! # Example
//!
//! ```rust,ignore
//! use transcode_pool::prelude::*;
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env()
//!         .add_directive("transcode_pool=debug".parse().unwrap()))
//!     .init();
//!
//! let pool = TranscodePool::new(PoolConfig::new(4), MyCodec::default())?;
//! let span = tracing::info_span!("upload", user = 42);
//! let handle = span.in_scope(|| pool.submit(bytes, ConvertOptions::default()))?;
//! ```

/// Metrics recording functions.
pub mod metrics {
    use std::time::Duration;

    /// Records a task submission.
    #[inline]
    pub fn record_submission(queue_depth: usize) {
        ::tracing::trace!(
            counter.tasks_submitted = 1,
            gauge.queue_depth = queue_depth as i64,
            "task submitted"
        );
    }

    /// Records a codec run that returned.
    #[inline]
    pub fn record_completion(duration: Duration, success: bool) {
        let duration_ms = duration.as_millis() as u64;
        if success {
            ::tracing::trace!(
                counter.tasks_completed = 1,
                histogram.convert_duration_ms = duration_ms,
                "conversion completed"
            );
        } else {
            ::tracing::trace!(
                counter.tasks_failed = 1,
                histogram.convert_duration_ms = duration_ms,
                "conversion failed"
            );
        }
    }

    /// Records a codec panic, which takes its unit down.
    #[inline]
    pub fn record_crash(duration: Duration) {
        ::tracing::trace!(
            counter.unit_crashes = 1,
            histogram.convert_duration_ms = duration.as_millis() as u64,
            "codec panicked"
        );
    }

    /// Records a task hitting its deadline.
    #[inline]
    pub fn record_timeout(task_id: u64, timeout: Duration) {
        ::tracing::debug!(
            counter.tasks_timed_out = 1,
            task_id = task_id,
            timeout_ms = timeout.as_millis() as u64,
            "task deadline elapsed"
        );
    }

    /// Records a unit picking up a task.
    #[inline]
    pub fn record_unit_busy(unit_id: usize) {
        ::tracing::trace!(gauge.units_busy = 1, unit_id = unit_id, "unit busy");
    }

    /// Records a unit going back to idle.
    #[inline]
    pub fn record_unit_idle(unit_id: usize) {
        ::tracing::trace!(gauge.units_busy = -1i64, unit_id = unit_id, "unit idle");
    }

    /// Records a capacity change.
    #[inline]
    pub fn record_capacity_change(from: usize, to: usize) {
        ::tracing::info!(
            gauge.capacity = to as i64,
            previous = from,
            "pool capacity changed"
        );
    }

    /// Records the end of a close.
    #[inline]
    pub fn record_pool_close(mode: &str, abandoned: usize) {
        ::tracing::info!(mode = mode, abandoned = abandoned, "transcode pool closed");
    }
}
