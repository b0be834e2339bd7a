//! Shared audio reference clock.
//!
//! The audio output path publishes `(media time, realtime reference, epoch)`
//! whenever it pushes samples to the device; the presentation thread reads
//! it once per tick and extrapolates forward by the wall time elapsed since
//! the publish. The lock is held only for the copy, never across the
//! extrapolation arithmetic.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::frame::{Epoch, MediaTime};

/// One extrapolated clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Audio media time projected to the sampling instant, in nanoseconds
    pub media_time: MediaTime,
    /// Epoch the reading belongs to
    pub epoch: Epoch,
}

struct ClockState {
    media_time: MediaTime,
    /// `None` until the first publish of the current epoch; sampling yields
    /// nothing while unset
    reference: Option<Instant>,
    epoch: Epoch,
}

/// Clock handle shared between the audio and presentation threads.
#[derive(Clone)]
pub struct AudioClock {
    inner: Arc<Mutex<ClockState>>,
}

impl AudioClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockState {
                media_time: 0,
                reference: None,
                epoch: 1,
            })),
        }
    }

    /// Publishes the audio position as of now.
    pub fn publish(&self, media_time: MediaTime, epoch: Epoch) {
        self.publish_at(media_time, epoch, Instant::now());
    }

    /// Publishes the audio position as of `reference`.
    pub fn publish_at(&self, media_time: MediaTime, epoch: Epoch, reference: Instant) {
        let mut state = self.inner.lock();
        state.media_time = media_time;
        state.reference = Some(reference);
        state.epoch = epoch;
    }

    /// Reads the clock extrapolated to now; `None` until the first publish
    /// of the current epoch.
    pub fn sample(&self) -> Option<ClockSample> {
        self.sample_at(Instant::now())
    }

    /// Reads the clock extrapolated to `now`.
    pub fn sample_at(&self, now: Instant) -> Option<ClockSample> {
        let state = self.inner.lock();
        let reference = state.reference?;
        let elapsed = now.saturating_duration_since(reference).as_nanos() as i64;
        Some(ClockSample {
            media_time: state.media_time + elapsed,
            epoch: state.epoch,
        })
    }

    /// Starts a new epoch (seek, stream restart) and invalidates the clock
    /// until the audio path publishes again. Returns the new epoch.
    pub fn begin_epoch(&self) -> Epoch {
        let mut state = self.inner.lock();
        state.epoch = state.epoch.wrapping_add(1);
        state.reference = None;
        tracing::debug!(epoch = state.epoch, "audio clock epoch advanced");
        state.epoch
    }

    /// Current epoch without validity implications.
    pub fn epoch(&self) -> Epoch {
        self.inner.lock().epoch
    }
}

impl Default for AudioClock {
    fn default() -> Self {
        Self::new()
    }
}
