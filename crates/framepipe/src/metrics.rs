//! Lock-free playback counters.
//!
//! Shared between the pipeline threads through an `Arc`; every update is a
//! single atomic op so recording never contends with the pool mutex.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct StatsInner {
    frames_presented: AtomicU64,
    blended_frames: AtomicU64,
    freeze_ticks: AtomicU64,
    alloc_failures: AtomicU64,
    discarded_samples: AtomicU64,
    flushes: AtomicU64,
    drift_ns: AtomicI64,
    /// Filtered drift in microseconds; stored as an integer to stay atomic
    filtered_drift_us: AtomicI64,
    /// Worst absolute filtered drift seen this session, microseconds
    max_filtered_drift_us: AtomicI64,
    degraded: AtomicBool,
}

/// Cloneable handle to the session's playback counters.
#[derive(Clone, Default)]
pub struct PlaybackStats {
    inner: Arc<StatsInner>,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_presented(&self) {
        self.inner.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blend(&self) {
        self.inner.blended_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_freeze_tick(&self) {
        self.inner.freeze_ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure(&self) {
        self.inner.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_sample(&self) {
        self.inner.discarded_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// Stores the latest raw and filtered drift readings.
    pub fn record_drift(&self, raw_ns: i64, filtered_secs: f64) {
        let us = (filtered_secs * 1e6) as i64;
        self.inner.drift_ns.store(raw_ns, Ordering::Relaxed);
        self.inner.filtered_drift_us.store(us, Ordering::Relaxed);
        self.inner
            .max_filtered_drift_us
            .fetch_max(us.abs(), Ordering::Relaxed);
    }

    pub fn set_degraded(&self, degraded: bool) {
        self.inner.degraded.store(degraded, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_presented: self.inner.frames_presented.load(Ordering::Relaxed),
            blended_frames: self.inner.blended_frames.load(Ordering::Relaxed),
            freeze_ticks: self.inner.freeze_ticks.load(Ordering::Relaxed),
            alloc_failures: self.inner.alloc_failures.load(Ordering::Relaxed),
            discarded_samples: self.inner.discarded_samples.load(Ordering::Relaxed),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            drift_ns: self.inner.drift_ns.load(Ordering::Relaxed),
            filtered_drift_us: self.inner.filtered_drift_us.load(Ordering::Relaxed),
            max_filtered_drift_us: self.inner.max_filtered_drift_us.load(Ordering::Relaxed),
            degraded: self.inner.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_presented: u64,
    pub blended_frames: u64,
    pub freeze_ticks: u64,
    pub alloc_failures: u64,
    pub discarded_samples: u64,
    pub flushes: u64,
    /// Last accepted raw drift sample, nanoseconds
    pub drift_ns: i64,
    /// Last filtered drift estimate, microseconds
    pub filtered_drift_us: i64,
    /// Largest absolute filtered drift recorded since session start
    pub max_filtered_drift_us: i64,
    pub degraded: bool,
}
