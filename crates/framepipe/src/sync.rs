//! Audio/video drift estimation and per-tick duration/blend arithmetic.
//!
//! The drift tracker runs once per display tick on the presentation thread.
//! It compares the extrapolated audio clock against the adjusted video pts,
//! pushes the raw difference through a scalar Kalman filter, and turns the
//! filtered estimate into a stretched or compressed output duration for the
//! next frame. A positive estimate means the audio clock is ahead (video
//! lagging), so more of the frame's on-screen budget is consumed per tick
//! until the timelines meet again; the penalty grows with the square of the
//! drift so small offsets are tolerated and large ones corrected hard.
//!
//! Epoch changes (seeks, stream restarts) reset the filter and open a settle
//! window of ticks during which drift is pinned to zero, absorbing the audio
//! clock's startup jitter instead of steering on it.

use crate::clock::ClockSample;
use crate::frame::{Epoch, FrameBuffer, MediaTime};

/// Scalar Kalman filter over the drift measurement, one state variable with
/// fixed process and measurement noise.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    x_next: f64,
    p_next: f64,
    q: f64,
    r: f64,
    k: f64,
}

impl KalmanFilter {
    pub fn new() -> Self {
        Self {
            x_next: 0.0,
            p_next: 1.0,
            q: 1.0 / 100_000.0,
            r: 0.01,
            k: 0.0,
        }
    }

    /// Back to the initial high-uncertainty state.
    pub fn reset(&mut self) {
        self.x_next = 0.0;
        self.p_next = 1.0;
        self.k = 0.0;
    }

    /// One predict/update step over measurement `z`, returning the new
    /// state estimate.
    pub fn update(&mut self, z: f64) -> f64 {
        let p1 = self.p_next + self.q;
        self.k = p1 / (p1 + self.r);
        let x = self.x_next + self.k * (z - self.x_next);
        self.p_next = (1.0 - self.k) * p1;
        self.x_next = x;
        x
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tuning for the drift feedback loop. The settle window and quadratic cap
/// are empirical knobs, not derivable values, hence configuration.
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Ticks after an epoch change during which drift is forced to zero
    pub settle_ticks: u32,
    /// Hard cap on the per-tick duration adjustment, in nanoseconds
    pub max_adjust: i64,
    /// Raw samples beyond this magnitude are discarded as corrupt, in
    /// nanoseconds
    pub sanity_bound: i64,
    /// Fixed look-ahead subtracted from video pts, compensating
    /// display-to-eye latency, in nanoseconds
    pub lookahead_bias: i64,
    /// Clamp on the filtered estimate, in seconds
    pub filter_clamp: f64,
    /// User-requested constant A/V offset, in nanoseconds
    pub user_delta: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            settle_ticks: 5,
            max_adjust: 5_000_000,
            sanity_bound: 10_000_000_000,
            lookahead_bias: 16_666_000,
            filter_clamp: 10.0,
            user_delta: 0,
        }
    }
}

/// What a single drift measurement did, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftOutcome {
    /// Filter updated with a fresh sample
    Applied,
    /// Frame epoch changed; filter reinitialized, settle window opened
    EpochReset,
    /// Inside the post-reset settle window, drift pinned to zero
    Settling,
    /// No valid audio clock yet, drift pinned to zero
    NoClock,
    /// Clock and frame disagree on epoch, drift pinned to zero
    ClockEpochMismatch,
    /// Sample outside the sanity bound, filter untouched
    Discarded,
}

/// Per-session drift state, mutated once per tick.
pub struct DriftTracker {
    config: SyncConfig,
    filter: KalmanFilter,
    filtered: f64,
    raw_ns: i64,
    settle_remaining: u32,
    last_epoch: Option<Epoch>,
}

impl DriftTracker {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            filter: KalmanFilter::new(),
            filtered: 0.0,
            raw_ns: 0,
            settle_remaining: 0,
            last_epoch: None,
        }
    }

    /// Filtered drift estimate in seconds, always within the configured
    /// clamp. The sole authority for ahead/behind decisions.
    pub fn filtered_drift(&self) -> f64 {
        self.filtered
    }

    /// Last accepted raw sample in nanoseconds.
    pub fn raw_drift(&self) -> i64 {
        self.raw_ns
    }

    /// Feeds one tick's measurement: the extrapolated audio clock against
    /// the displayed frame's adjusted pts.
    ///
    /// An epoch change resets the filter exactly once; subsequent frames in
    /// the same epoch ride the settle window down instead of re-resetting.
    pub fn measure(
        &mut self,
        clock: Option<ClockSample>,
        pts: MediaTime,
        frame_epoch: Epoch,
    ) -> DriftOutcome {
        if self.last_epoch != Some(frame_epoch) {
            self.last_epoch = Some(frame_epoch);
            self.filter.reset();
            self.filtered = 0.0;
            self.raw_ns = 0;
            self.settle_remaining = self.config.settle_ticks;
            tracing::debug!(epoch = frame_epoch, "clock epoch changed, drift filter reset");
            return DriftOutcome::EpochReset;
        }

        if self.settle_remaining > 0 {
            self.settle_remaining -= 1;
            self.filtered = 0.0;
            self.raw_ns = 0;
            return DriftOutcome::Settling;
        }

        let Some(sample) = clock else {
            self.filtered = 0.0;
            self.raw_ns = 0;
            return DriftOutcome::NoClock;
        };

        if sample.epoch != frame_epoch {
            // The clock has not caught up with the frame's interval yet;
            // anything the filter accumulated is from the old timeline.
            self.filter.reset();
            self.filtered = 0.0;
            self.raw_ns = 0;
            return DriftOutcome::ClockEpochMismatch;
        }

        let raw = sample.media_time - (pts - self.config.lookahead_bias) - self.config.user_delta;
        if raw.abs() > self.config.sanity_bound {
            return DriftOutcome::Discarded;
        }

        self.raw_ns = raw;
        let clamp = self.config.filter_clamp;
        self.filtered = self.filter.update(raw as f64 / 1e9).clamp(-clamp, clamp);
        DriftOutcome::Applied
    }

    /// Stretches or compresses the nominal frame duration by a penalty
    /// quadratic in the filtered drift, capped at `max_adjust`. Video behind
    /// audio consumes budget faster; video ahead consumes it slower.
    pub fn output_duration(&self, nominal: i64) -> i64 {
        let nominal = nominal.max(0);
        if self.filtered == 0.0 {
            return nominal;
        }
        let millis = self.filtered * 1_000.0;
        let penalty = ((millis * millis) * 1_000.0) as i64;
        let penalty = penalty.min(self.config.max_adjust);
        if self.filtered > 0.0 {
            nominal + penalty
        } else {
            (nominal - penalty).max(0)
        }
    }
}

/// Result of one tick's duration accounting over the front of the display
/// queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendPlan {
    /// The tick's effective pts: the front frame's while it contributes
    /// budget, the back frame's original pts on a full shortfall, the
    /// advanced pts when holding the last frame
    pub pts: Option<MediaTime>,
    /// Weight of the older (front) frame in the blended output
    pub blend: f32,
    /// Front frame's budget hit zero; recycle it after this tick
    pub front_exhausted: bool,
    /// Back frame's budget hit zero as well (blend shortfall)
    pub back_exhausted: bool,
}

/// Consumes `output_duration` worth of on-screen budget from the front
/// frame, spilling into the back frame when the front cannot cover the tick.
///
/// Durations never go negative: shortfalls clamp exactly to zero, and any
/// budget the pair cannot cover is accounted by advancing the back frame's
/// pts past its end. With no back frame available the front is held on
/// screen, its pts advancing so the drift loop keeps tracking real time.
pub fn compute_blend(
    front: &mut FrameBuffer,
    back: Option<&mut FrameBuffer>,
    output_duration: i64,
) -> BlendPlan {
    let out = output_duration.max(0);

    if front.duration >= out {
        let pts = front.pts;
        if let Some(p) = front.pts {
            front.pts = Some(p + out);
        }
        front.duration -= out;
        return BlendPlan {
            pts,
            blend: 0.0,
            front_exhausted: front.duration == 0,
            back_exhausted: false,
        };
    }

    let Some(back) = back else {
        // Hold-last-frame: decoder starved, keep the picture up and let its
        // pts track the passage of output time. The advanced value is the
        // tick's effective pts so the drift loop follows real time.
        if let Some(p) = front.pts {
            front.pts = Some(p + out);
        }
        return BlendPlan {
            pts: front.pts,
            blend: 0.0,
            front_exhausted: false,
            back_exhausted: false,
        };
    };

    let blend = if out > 0 {
        front.duration as f32 / out as f32
    } else {
        0.0
    };
    let shortfall = out - front.duration;
    front.duration = 0;

    // While the back frame still covers the shortfall, the tick belongs to
    // the front frame; only a full shortfall hands the back frame's
    // original pts to the drift loop.
    let (pts, back_exhausted) = if back.duration >= shortfall {
        back.duration -= shortfall;
        if let Some(p) = back.pts {
            back.pts = Some(p + shortfall);
        }
        (front.pts, back.duration == 0)
    } else {
        let pts = back.pts;
        let deficit = shortfall - back.duration;
        back.duration = 0;
        if let Some(p) = back.pts {
            back.pts = Some(p + deficit);
        }
        (pts, true)
    };

    BlendPlan {
        pts,
        blend,
        front_exhausted: true,
        back_exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PlaneLayout;

    fn frame(pts: MediaTime, duration: i64, epoch: Epoch) -> FrameBuffer {
        let mut f = FrameBuffer::new(PlaneLayout::yuv420(4, 4));
        f.pts = Some(pts);
        f.duration = duration;
        f.epoch = epoch;
        f
    }

    fn sample(media_time: MediaTime, epoch: Epoch) -> Option<ClockSample> {
        Some(ClockSample { media_time, epoch })
    }

    fn settled_tracker(config: SyncConfig) -> DriftTracker {
        let mut t = DriftTracker::new(config);
        t.measure(sample(0, 1), 0, 1);
        for _ in 0..config.settle_ticks {
            t.measure(sample(0, 1), 0, 1);
        }
        t
    }

    #[test]
    fn test_kalman_converges_to_constant_input() {
        let mut filter = KalmanFilter::new();
        let mut x = 0.0;
        for _ in 0..200 {
            x = filter.update(0.25);
        }
        assert!((x - 0.25).abs() < 1e-3, "estimate {x}");
    }

    #[test]
    fn test_filtered_drift_stays_in_clamp_under_spikes() {
        let config = SyncConfig::default();
        let mut t = settled_tracker(config);
        // Alternating near-bound spikes must never push the estimate past
        // the clamp.
        for i in 0..500 {
            let sign = if i % 2 == 0 { 1 } else { -1 };
            t.measure(sample(sign * 9_000_000_000, 1), 0, 1);
            assert!(t.filtered_drift().abs() <= config.filter_clamp);
        }
    }

    #[test]
    fn test_out_of_bound_sample_discarded_filter_untouched() {
        let mut t = settled_tracker(SyncConfig::default());
        t.measure(sample(2_000_000, 1), 0, 1);
        let before = t.filtered_drift();

        let outcome = t.measure(sample(50_000_000_000, 1), 0, 1);
        assert_eq!(outcome, DriftOutcome::Discarded);
        assert_eq!(t.filtered_drift(), before);
    }

    #[test]
    fn test_epoch_change_resets_exactly_once() {
        let mut t = settled_tracker(SyncConfig::default());
        t.measure(sample(5_000_000, 1), 0, 1);
        assert_ne!(t.filtered_drift(), 0.0);

        // First frame of the new epoch resets; the second one merely
        // continues the settle countdown.
        assert_eq!(t.measure(sample(0, 2), 0, 2), DriftOutcome::EpochReset);
        assert_eq!(t.filtered_drift(), 0.0);
        assert_eq!(t.measure(sample(0, 2), 0, 2), DriftOutcome::Settling);
    }

    #[test]
    fn test_settle_window_pins_drift_to_zero() {
        let config = SyncConfig {
            settle_ticks: 3,
            ..SyncConfig::default()
        };
        let mut t = DriftTracker::new(config);
        assert_eq!(t.measure(sample(1_000_000, 1), 0, 1), DriftOutcome::EpochReset);
        for _ in 0..3 {
            assert_eq!(t.measure(sample(1_000_000, 1), 0, 1), DriftOutcome::Settling);
            assert_eq!(t.filtered_drift(), 0.0);
        }
        assert_eq!(t.measure(sample(1_000_000, 1), 0, 1), DriftOutcome::Applied);
    }

    #[test]
    fn test_clock_epoch_mismatch_reinitializes_filter() {
        let mut t = settled_tracker(SyncConfig::default());
        t.measure(sample(5_000_000, 1), 0, 1);
        assert_ne!(t.filtered_drift(), 0.0);

        // Clock still on the old epoch: pin to zero and drop the filter's
        // accumulated state, but open no settle window.
        assert_eq!(
            t.measure(sample(5_000_000, 7), 0, 1),
            DriftOutcome::ClockEpochMismatch
        );
        assert_eq!(t.filtered_drift(), 0.0);

        // A zero-drift sample lands on exactly zero only if the filter was
        // reinitialized; leftover state would bleed through.
        assert_eq!(t.measure(sample(-16_666_000, 1), 0, 1), DriftOutcome::Applied);
        assert_eq!(t.filtered_drift(), 0.0);
    }

    #[test]
    fn test_output_duration_quadratic_and_capped() {
        let config = SyncConfig::default();
        let nominal = 16_666_000;

        let mut t = settled_tracker(config);
        // Small positive drift: video behind, budget consumed faster.
        for _ in 0..50 {
            t.measure(sample(1_000_000, 1), 0, 1);
        }
        let out = t.output_duration(nominal);
        assert!(out > nominal);
        assert!(out <= nominal + config.max_adjust);

        // Large sustained drift saturates at the cap.
        let mut t = settled_tracker(config);
        for _ in 0..200 {
            t.measure(sample(9_000_000_000, 1), 0, 1);
        }
        assert_eq!(t.output_duration(nominal), nominal + config.max_adjust);

        // Negative drift compresses, never below zero.
        let mut t = settled_tracker(config);
        for _ in 0..200 {
            t.measure(sample(-9_000_000_000, 1), 0, 1);
        }
        assert_eq!(t.output_duration(nominal), nominal - config.max_adjust);
        assert_eq!(t.output_duration(1_000_000), 0);
    }

    #[test]
    fn test_single_frame_keeps_residual_budget() {
        let mut a = frame(1000, 40, 1);
        let plan = compute_blend(&mut a, None, 16);

        assert_eq!(plan.pts, Some(1000));
        assert_eq!(plan.blend, 0.0);
        assert!(!plan.front_exhausted);
        assert_eq!(a.duration, 24);
        assert_eq!(a.pts, Some(1016));
    }

    #[test]
    fn test_blend_consumes_exact_shortfall_from_back() {
        let mut a = frame(1000, 10, 1);
        let mut b = frame(1040, 40, 1);
        let plan = compute_blend(&mut a, Some(&mut b), 30);

        // The front frame still contributes, so the tick is reported
        // against it.
        assert_eq!(plan.pts, Some(1000));
        assert!((plan.blend - 10.0 / 30.0).abs() < 1e-6);
        assert!(plan.front_exhausted);
        assert!(!plan.back_exhausted);
        assert_eq!(a.duration, 0);
        assert_eq!(b.duration, 20);
        assert_eq!(b.pts, Some(1060));
    }

    #[test]
    fn test_blend_shortfall_consumes_both_and_advances_back_pts() {
        let mut a = frame(1000, 5, 1);
        let mut b = frame(1005, 20, 1);
        let plan = compute_blend(&mut a, Some(&mut b), 30);

        assert_eq!(plan.pts, Some(1005));
        assert!(plan.front_exhausted);
        assert!(plan.back_exhausted);
        assert_eq!(a.duration, 0);
        assert_eq!(b.duration, 0);
        // 5 units of the tick were covered by neither frame; the back pts
        // advances past its end by exactly that amount.
        assert_eq!(b.pts, Some(1010));
    }

    #[test]
    fn test_hold_last_frame_advances_pts_only() {
        let mut a = frame(1000, 0, 1);
        let plan = compute_blend(&mut a, None, 16);

        // The advanced value is reported so drift keeps tracking real time
        // through the stall.
        assert_eq!(plan.pts, Some(1016));
        assert!(!plan.front_exhausted);
        assert_eq!(a.duration, 0);
        assert_eq!(a.pts, Some(1016));
    }

    #[test]
    fn test_durations_never_go_negative() {
        let mut a = frame(0, 3, 1);
        let mut b = frame(3, 2, 1);
        compute_blend(&mut a, Some(&mut b), 1_000_000);
        assert_eq!(a.duration, 0);
        assert_eq!(b.duration, 0);
    }
}
