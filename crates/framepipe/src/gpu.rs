//! GPU resource allocation and the presentation surface boundary.
//!
//! The allocator attaches backend objects (one write-mappable pixel buffer
//! plus three 2-D image targets) to frame buffers sitting in the
//! `pending_alloc` stage. Everything here runs on the presentation thread
//! only: the rendering backend has context-thread affinity, so the decoder
//! never touches GPU handles, only the CPU staging memory it is handed after
//! allocation completes.

use thiserror::Error;

use crate::frame::{FrameBuffer, GpuHandleState, PlaneLayout, StagingRegion};
use crate::frame_pool::FramePool;
use crate::metrics::PlaybackStats;
use crate::presenter::TickOutput;

/// Consecutive allocation failures before playback is flagged as degraded.
const DEGRADED_FAILURE_THRESHOLD: u32 = 8;

/// Errors reported by the presentation backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GpuError {
    /// The backend could not allocate buffer or image storage
    #[error("GPU resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Plane transfer into image storage failed
    #[error("frame upload failed: {0}")]
    UploadFailed(String),
}

/// Opaque backend object ids for one frame buffer: a write-mappable pixel
/// buffer and three 2-D image targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuHandles {
    /// Mappable pixel buffer id
    pub buffer: u64,
    /// Per-plane image target ids
    pub textures: [u64; 3],
}

/// The external presentation surface.
///
/// Pixel-format and shader details are the backend's concern; the pipeline
/// only asks it to create/destroy per-frame storage, transfer planes, and
/// draw the per-tick selection. All calls happen on the presentation thread.
pub trait PresentationGpu {
    /// Creates a write-mappable region sized to the sum of the three planes'
    /// byte sizes, plus three 2-D image targets.
    fn alloc(&mut self, layout: &PlaneLayout) -> Result<GpuHandles, GpuError>;

    /// Destroys the backend objects behind `handles`.
    fn release(&mut self, handles: GpuHandles);

    /// Transfers the three planes from the staging region into image storage
    /// at the layout's recorded offsets, with linear filtering and edge-clamp
    /// addressing. The staging side is unmapped for the duration.
    fn upload(
        &mut self,
        handles: &GpuHandles,
        region: &StagingRegion,
        layout: &PlaneLayout,
    ) -> Result<(), GpuError>;

    /// Draws the tick's selection: nothing, a single frame, or a frame pair
    /// linearly interpolated by the blend factor.
    fn draw(&mut self, output: &TickOutput);
}

/// Presentation-thread allocator pass over the pool's `pending_alloc` stage.
///
/// Tracks consecutive failures so persistent resource exhaustion can be
/// surfaced as a degraded-playback warning instead of a fatal error.
pub struct GpuAllocator {
    consecutive_failures: u32,
}

impl GpuAllocator {
    pub fn new() -> Self {
        Self {
            consecutive_failures: 0,
        }
    }

    /// Runs one allocation pass: grows the pool toward the decoder's demand,
    /// then attaches GPU resources to every buffer awaiting allocation.
    ///
    /// The pool mutex is held for the whole pass; only the presentation
    /// thread runs this, and the decoder communicates through the condvars.
    pub fn run(&mut self, pool: &FramePool, gpu: &mut dyn PresentationGpu, stats: &PlaybackStats) {
        let layout = pool.layout();
        let mut state = pool.lock_state();

        // Handles stripped by a flush are destroyed here, on the thread that
        // owns the rendering context.
        for handles in std::mem::take(&mut state.retired_handles) {
            gpu.release(handles);
        }

        // During teardown nothing new is created; buffers parked in
        // pending_alloc drop back to avail so waiters can observe the
        // shutdown flag.
        if pool.is_shutdown() {
            while let Some(idx) = state.pending_alloc.pop_front() {
                state.avail.push_back(idx);
            }
            pool.notify_alloc_done();
            return;
        }

        // Grow toward the high-water mark while the decoder wants more
        // frames than currently exist.
        while state.slots.len() < state.needed_frames {
            let idx = state.slots.len();
            state.slots.push(FrameBuffer::new(layout));
            state.avail.push_back(idx);
            pool.notify_avail();
            tracing::debug!("pool grown to {} frames", state.slots.len());
        }

        while let Some(idx) = state.pending_alloc.pop_front() {
            let slot = &mut state.slots[idx];

            // Defensive re-creation: never assume a handle from a previous
            // cycle is still valid.
            if let Some(stale) = slot.handles.take() {
                gpu.release(stale);
            }
            slot.gpu = GpuHandleState::Unallocated;

            match gpu.alloc(&layout) {
                Ok(handles) => {
                    slot.handles = Some(handles);
                    slot.staging = Some(StagingRegion::new(&layout));
                    slot.gpu = GpuHandleState::Mapped;
                    state.alloc_ready.push_back(idx);
                    pool.notify_alloc_done();
                    self.consecutive_failures = 0;
                    stats.set_degraded(false);
                }
                Err(e) => {
                    // Fatal to this cycle's frame: drop it back to avail
                    // rather than retrying synchronously.
                    tracing::warn!("GPU allocation failed, dropping frame: {e}");
                    stats.record_alloc_failure();
                    state.avail.push_back(idx);
                    pool.notify_avail();
                    // The decoder that parked this slot is waiting on the
                    // alloc condvar; wake it so it can reclaim from avail.
                    pool.notify_alloc_done();

                    self.consecutive_failures += 1;
                    if self.consecutive_failures == DEGRADED_FAILURE_THRESHOLD {
                        tracing::warn!(
                            "{} consecutive GPU allocation failures, playback degraded",
                            self.consecutive_failures
                        );
                        stats.set_degraded(true);
                    }
                }
            }
        }
    }
}

impl Default for GpuAllocator {
    fn default() -> Self {
        Self::new()
    }
}
