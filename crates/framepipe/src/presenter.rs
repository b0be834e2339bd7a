//! Per-tick frame selection and handoff to the presentation surface.
//!
//! [`Presenter::tick`] runs once per display refresh on the presentation
//! thread. Each tick: run the GPU allocator pass, recycle spent frames back
//! to the decoder, consume output-duration budget from the head of the
//! display queue (blending into its successor when the head cannot cover the
//! tick), feed the tick's effective pts back into the drift tracker, and
//! hand the selection to the surface. When the decoder is starved the last
//! displayed frame stays on screen rather than cutting to black.

use crate::clock::AudioClock;
use crate::frame::{FrameBuffer, GpuHandleState, PlaneLayout};
use crate::frame_pool::FramePool;
use crate::gpu::{GpuAllocator, GpuHandles, PresentationGpu};
use crate::metrics::PlaybackStats;
use crate::sync::{compute_blend, DriftOutcome, DriftTracker, SyncConfig};

/// Default display refresh period (60 Hz).
pub const DEFAULT_TICK_DURATION: i64 = 16_666_000;

/// Everything the surface needs to draw one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRef {
    pub handles: GpuHandles,
    pub layout: PlaneLayout,
    pub deinterlace_offset: f32,
}

/// One tick's selection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutput {
    /// Nothing to show
    Blank,
    Single {
        frame: FrameRef,
        alpha: f32,
    },
    /// Two frames linearly interpolated, `blend` weighting the older one
    Blend {
        front: FrameRef,
        back: FrameRef,
        blend: f32,
        alpha: f32,
    },
}

/// Presentation-thread driver for one playback session.
pub struct Presenter {
    pool: FramePool,
    clock: AudioClock,
    allocator: GpuAllocator,
    drift: DriftTracker,
    stats: PlaybackStats,
    /// Display refresh period; the nominal amount of media time one tick
    /// consumes
    tick_duration: i64,
    alpha: f32,
    paused: bool,
}

impl Presenter {
    pub fn new(pool: FramePool, clock: AudioClock, config: SyncConfig, stats: PlaybackStats) -> Self {
        Self {
            pool,
            clock,
            allocator: GpuAllocator::new(),
            drift: DriftTracker::new(config),
            stats,
            tick_duration: DEFAULT_TICK_DURATION,
            alpha: 1.0,
            paused: false,
        }
    }

    /// Sets the display refresh period. Frames whose duration exceeds this
    /// span several ticks; shorter ones blend into their successor.
    pub fn set_tick_duration(&mut self, tick_duration: i64) {
        self.tick_duration = tick_duration.max(1);
    }

    /// Freezes duration consumption; selection still runs but nothing
    /// advances while paused.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Opacity passed through to the surface.
    pub fn set_alpha(&mut self, alpha: f32) {
        self.alpha = alpha.clamp(0.0, 1.0);
    }

    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Empties the pipeline on seek/stop. GPU handles are destroyed on the
    /// next tick's allocator pass.
    pub fn flush(&mut self) {
        self.pool.flush();
        self.stats.record_flush();
    }

    /// Runs one display tick and hands the selection to the surface.
    pub fn tick(&mut self, gpu: &mut dyn PresentationGpu) -> TickOutput {
        self.allocator.run(&self.pool, gpu, &self.stats);

        let mut guard = self.pool.lock_state();
        let state = &mut *guard;

        if state.display_ready.is_empty() {
            // Decoder starved: freeze on whatever was shown last.
            let output = match state.displaying.back() {
                Some(&idx) => match uploaded_ref(&state.slots[idx]) {
                    Some(frame) => {
                        self.stats.record_freeze_tick();
                        TickOutput::Single {
                            frame,
                            alpha: self.alpha,
                        }
                    }
                    None => TickOutput::Blank,
                },
                None => TickOutput::Blank,
            };
            drop(guard);
            gpu.draw(&output);
            return output;
        }

        // Fresh frames queued: everything previously displayed can go back
        // to the decoder.
        if state.recycle_displaying() > 0 {
            self.pool.notify_avail();
        }

        let front_idx = state.display_ready[0];
        let back_idx = state.display_ready.get(1).copied();

        if self.paused {
            let output = match ensure_uploaded(&mut state.slots[front_idx], gpu) {
                Some(frame) => TickOutput::Single {
                    frame,
                    alpha: self.alpha,
                },
                None => TickOutput::Blank,
            };
            drop(guard);
            gpu.draw(&output);
            return output;
        }

        let nominal = self.tick_duration;
        let frame_epoch = state.slots[front_idx].epoch;
        let output_duration = self.drift.output_duration(nominal);

        let plan = match back_idx {
            Some(b) => {
                let (front, back) = two_mut(&mut state.slots, front_idx, b);
                compute_blend(front, Some(back), output_duration)
            }
            None => compute_blend(&mut state.slots[front_idx], None, output_duration),
        };

        // The tick's effective pts, pulled back by two frame periods to
        // approximate when this picture actually reaches the glass, feeds
        // the next tick's drift estimate.
        if let Some(pts) = plan.pts {
            match self
                .drift
                .measure(self.clock.sample(), pts - 2 * nominal, frame_epoch)
            {
                DriftOutcome::Applied => self
                    .stats
                    .record_drift(self.drift.raw_drift(), self.drift.filtered_drift()),
                DriftOutcome::Discarded => self.stats.record_discarded_sample(),
                _ => {}
            }
        }

        let front_ref = ensure_uploaded(&mut state.slots[front_idx], gpu);
        let back_ref = match back_idx {
            Some(b) if plan.blend > 0.0 => ensure_uploaded(&mut state.slots[b], gpu),
            _ => None,
        };

        // Retire the exhausted head after upload so it can serve as the
        // freeze-frame source until newer frames displace it. A blend
        // shortfall exhausts the back frame as well.
        if plan.front_exhausted {
            state.display_ready.pop_front();
            state.displaying.push_back(front_idx);
        }
        if plan.back_exhausted {
            if let Some(b) = back_idx {
                if state.display_ready.front() == Some(&b) {
                    state.display_ready.pop_front();
                    state.displaying.push_back(b);
                }
            }
        }

        let output = match (front_ref, back_ref) {
            (Some(front), Some(back)) => {
                self.stats.record_presented();
                self.stats.record_blend();
                TickOutput::Blend {
                    front,
                    back,
                    blend: plan.blend,
                    alpha: self.alpha,
                }
            }
            (Some(frame), None) | (None, Some(frame)) => {
                self.stats.record_presented();
                TickOutput::Single {
                    frame,
                    alpha: self.alpha,
                }
            }
            (None, None) => TickOutput::Blank,
        };

        drop(guard);
        gpu.draw(&output);
        output
    }
}

/// Transfers the frame's planes to image storage if that has not happened
/// this cycle, then returns a drawable reference.
fn ensure_uploaded(slot: &mut FrameBuffer, gpu: &mut dyn PresentationGpu) -> Option<FrameRef> {
    let handles = slot.handles?;
    if slot.gpu == GpuHandleState::Mapped {
        let region = slot.staging.as_ref()?;
        if let Err(e) = gpu.upload(&handles, region, &slot.layout) {
            tracing::warn!("frame upload failed: {e}");
            return None;
        }
        slot.gpu = GpuHandleState::Uploaded;
    }
    uploaded_ref(slot)
}

fn uploaded_ref(slot: &FrameBuffer) -> Option<FrameRef> {
    let handles = slot.handles?;
    (slot.gpu == GpuHandleState::Uploaded).then_some(FrameRef {
        handles,
        layout: slot.layout,
        deinterlace_offset: slot.deinterlace_offset,
    })
}

/// Disjoint mutable access to two arena slots.
fn two_mut(slots: &mut [FrameBuffer], a: usize, b: usize) -> (&mut FrameBuffer, &mut FrameBuffer) {
    debug_assert_ne!(a, b);
    if a < b {
        let (lo, hi) = slots.split_at_mut(b);
        (&mut lo[a], &mut hi[0])
    } else {
        let (lo, hi) = slots.split_at_mut(a);
        (&mut hi[0], &mut lo[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MediaTime, PlaneLayout};
    use crate::frame_pool::{FrameInfo, PoolConfig};
    use crate::gpu::test_support::TestGpu;
    use std::time::Duration;

    fn setup() -> (Presenter, FramePool, AudioClock, TestGpu) {
        let pool = FramePool::new(PlaneLayout::yuv420(8, 8), PoolConfig::default());
        let clock = AudioClock::new();
        let mut presenter = Presenter::new(
            pool.clone(),
            clock.clone(),
            SyncConfig::default(),
            PlaybackStats::new(),
        );
        // Tick and frame cadence match so one tick consumes one frame.
        presenter.set_tick_duration(16);
        (presenter, pool, clock, TestGpu::new())
    }

    /// Pushes one decoded frame through acquire/submit, driving the
    /// allocator from this thread while the acquire blocks on it.
    fn submit_frame(pool: &FramePool, gpu: &mut TestGpu, pts: MediaTime, duration: i64) {
        let pool2 = pool.clone();
        let handle = std::thread::spawn(move || pool2.acquire_for_decode());
        loop {
            GpuAllocator::new().run(pool, gpu, &PlaybackStats::new());
            if handle.is_finished() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let lease = handle.join().expect("acquire thread").expect("lease");
        pool.submit_decoded(
            lease,
            FrameInfo {
                pts,
                duration,
                epoch: 1,
                deinterlace_offset: 0.0,
            },
        );
    }

    #[test]
    fn test_empty_pipeline_draws_blank() {
        let (mut presenter, _pool, _clock, mut gpu) = setup();
        assert_eq!(presenter.tick(&mut gpu), TickOutput::Blank);
        assert_eq!(gpu.draws, 1);
    }

    #[test]
    fn test_single_frame_presented_then_frozen() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        submit_frame(&pool, &mut gpu, 0, 16);

        let first = presenter.tick(&mut gpu);
        let TickOutput::Single { frame, .. } = first else {
            panic!("expected single-frame output, got {first:?}");
        };
        assert_eq!(gpu.uploads, 1);

        // Starved now: the same picture stays up, no re-upload.
        for _ in 0..3 {
            assert_eq!(
                presenter.tick(&mut gpu),
                TickOutput::Single { frame, alpha: 1.0 }
            );
        }
        assert_eq!(gpu.uploads, 1);
        assert_eq!(presenter.stats().snapshot().freeze_ticks, 3);
    }

    #[test]
    fn test_recovery_recycles_frozen_frame() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        submit_frame(&pool, &mut gpu, 0, 16);
        presenter.tick(&mut gpu);
        presenter.tick(&mut gpu);
        assert_eq!(pool.stage_counts().displaying, 1);

        // A new frame arrives: the frozen one goes back to the decoder and
        // playback resumes.
        submit_frame(&pool, &mut gpu, 16, 16);
        let avail_before = pool.stage_counts().avail;
        let output = presenter.tick(&mut gpu);
        assert!(matches!(output, TickOutput::Single { .. }));
        assert_eq!(pool.stage_counts().avail, avail_before + 1);
        assert_eq!(pool.stage_counts().displaying, 1);
    }

    #[test]
    fn test_short_head_blends_into_successor() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        submit_frame(&pool, &mut gpu, 0, 16);
        submit_frame(&pool, &mut gpu, 16, 16);

        // Leave the head with less budget than one tick.
        let (front_idx, back_idx) = {
            let mut state = pool.lock_state();
            let front_idx = state.display_ready[0];
            let back_idx = state.display_ready[1];
            state.slots[front_idx].duration = 4;
            (front_idx, back_idx)
        };

        let output = presenter.tick(&mut gpu);
        let TickOutput::Blend { blend, .. } = output else {
            panic!("expected blended output, got {output:?}");
        };
        assert!((blend - 4.0 / 16.0).abs() < 1e-6);
        assert_eq!(gpu.uploads, 2);
        assert_eq!(presenter.stats().snapshot().blended_frames, 1);

        let state = pool.lock_state();
        // Front exhausted and retired; back covered the 12-unit shortfall.
        assert!(state.displaying.contains(&front_idx));
        assert_eq!(state.slots[back_idx].duration, 4);
        assert_eq!(state.slots[back_idx].pts, Some(28));
    }

    #[test]
    fn test_frames_outlive_ticks_at_display_rate() {
        // 24 fps content on a 60 Hz display: the tick length comes from the
        // refresh period, not the frame, so each frame spans multiple ticks
        // and hands over through a blend.
        let pool = FramePool::new(PlaneLayout::yuv420(8, 8), PoolConfig::default());
        let mut presenter = Presenter::new(
            pool.clone(),
            AudioClock::new(),
            SyncConfig::default(),
            PlaybackStats::new(),
        );
        let mut gpu = TestGpu::new();
        submit_frame(&pool, &mut gpu, 0, 41_666_000);
        submit_frame(&pool, &mut gpu, 41_666_000, 41_666_000);

        presenter.tick(&mut gpu);
        {
            let state = pool.lock_state();
            assert_eq!(state.display_ready.len(), 2);
            let front = &state.slots[state.display_ready[0]];
            assert_eq!(front.duration, 25_000_000);
            assert_eq!(front.pts, Some(16_666_000));
        }

        presenter.tick(&mut gpu);
        // Third tick: 8.334 ms of budget left, the handover blends.
        let output = presenter.tick(&mut gpu);
        assert!(matches!(output, TickOutput::Blend { .. }));
        assert_eq!(pool.lock_state().display_ready.len(), 1);
        assert_eq!(presenter.stats().snapshot().blended_frames, 1);
    }

    #[test]
    fn test_shortfall_retires_both_blended_frames() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        submit_frame(&pool, &mut gpu, 0, 4);
        submit_frame(&pool, &mut gpu, 4, 4);
        submit_frame(&pool, &mut gpu, 8, 16);
        let (first, second, third) = {
            let state = pool.lock_state();
            (
                state.display_ready[0],
                state.display_ready[1],
                state.display_ready[2],
            )
        };

        // One 16-unit tick swallows both short frames; the fresh frame must
        // front the queue afterwards, not a spent zero-duration one.
        let output = presenter.tick(&mut gpu);
        assert!(matches!(output, TickOutput::Blend { .. }));

        let state = pool.lock_state();
        assert_eq!(state.display_ready.front(), Some(&third));
        assert!(state.displaying.contains(&first));
        assert!(state.displaying.contains(&second));
        assert_eq!(state.slots[third].duration, 16);
        assert_eq!(state.slots[third].pts, Some(8));
    }

    #[test]
    fn test_paused_tick_advances_nothing() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        submit_frame(&pool, &mut gpu, 0, 16);
        presenter.set_paused(true);

        let output = presenter.tick(&mut gpu);
        assert!(matches!(output, TickOutput::Single { .. }));

        let state = pool.lock_state();
        let idx = state.display_ready[0];
        assert_eq!(state.slots[idx].duration, 16);
        assert_eq!(state.slots[idx].pts, Some(0));
    }

    #[test]
    fn test_flush_then_tick_releases_everything() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        submit_frame(&pool, &mut gpu, 0, 16);
        presenter.tick(&mut gpu);
        assert_eq!(gpu.live_handles.len(), 1);

        presenter.flush();
        assert_eq!(presenter.tick(&mut gpu), TickOutput::Blank);
        assert!(gpu.live_handles.is_empty());

        let counts = pool.stage_counts();
        assert_eq!(counts.avail, counts.total());
        assert_eq!(presenter.stats().snapshot().flushes, 1);
    }

    #[test]
    fn test_queue_conservation_across_ticks() {
        let (mut presenter, pool, _clock, mut gpu) = setup();
        let size = pool.stage_counts().total();

        for i in 0..6 {
            submit_frame(&pool, &mut gpu, i * 16, 16);
            presenter.tick(&mut gpu);
            assert_eq!(pool.stage_counts().total(), size);
        }
    }
}
