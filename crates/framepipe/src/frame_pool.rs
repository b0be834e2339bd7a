//! Frame pool and the five-stage queue pipeline.
//!
//! The pool owns a bounded arena of [`FrameBuffer`] slots and ferries each
//! one through a strict sequence of index FIFOs as it changes hands between
//! the decode thread and the presentation thread:
//!
//! 1. `avail` — no GPU resource, ready for the decoder to claim
//! 2. `pending_alloc` — awaiting GPU resource creation (presentation thread)
//! 3. `alloc_ready` — staging mapped, decoder may write
//! 4. `display_ready` — fully prepared, awaiting its turn on screen
//! 5. `displaying` — currently the active (or blend-source) frame(s)
//!
//! A slot index is a member of exactly one queue at any instant; a slot
//! checked out to the decoder (between `acquire_for_decode` and
//! `submit_decoded`) is tracked as leased instead. One mutex guards all
//! queue membership; two condvars ("a buffer became available" and "a buffer
//! finished GPU allocation") keep the decoder from spinning. Cancellation is
//! cooperative: the shutdown flag is checked before every blocking wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::frame::{Epoch, FrameBuffer, GpuHandleState, MediaTime, PlaneLayout, StagingRegion};
use crate::gpu::GpuHandles;

/// Pool sizing parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Slots created up front
    pub initial_frames: usize,
    /// High-water mark the pool may grow to on decoder demand
    pub max_frames: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_frames: 4,
            max_frames: 16,
        }
    }
}

/// Presentation metadata delivered with a decoded frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    /// Presentation timestamp
    pub pts: MediaTime,
    /// On-screen time budget
    pub duration: i64,
    /// Audio-clock epoch the frame belongs to
    pub epoch: Epoch,
    /// Sub-pixel vertical offset for interlaced sources
    pub deinterlace_offset: f32,
}

/// Exclusive write access to one frame's staging memory.
///
/// Returned by [`FramePool::acquire_for_decode`]; the decoder fills the
/// planes and hands the lease back through [`FramePool::submit_decoded`]
/// (or [`FramePool::release_lease`] on end of stream).
#[derive(Debug)]
pub struct DecodeLease {
    slot: usize,
    generation: u64,
    /// The frame's CPU-writable pixel storage
    pub region: StagingRegion,
    /// Plane dimensions and offsets the decoder must respect
    pub layout: PlaneLayout,
}

/// Per-stage occupancy snapshot, for diagnostics and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageCounts {
    pub avail: usize,
    pub pending_alloc: usize,
    pub alloc_ready: usize,
    pub display_ready: usize,
    pub displaying: usize,
    /// Slots checked out to the decoder
    pub leased: usize,
}

impl StageCounts {
    /// Sum over all stages plus outstanding leases; always equals the pool
    /// size.
    pub fn total(&self) -> usize {
        self.avail
            + self.pending_alloc
            + self.alloc_ready
            + self.display_ready
            + self.displaying
            + self.leased
    }
}

pub(crate) struct PoolState {
    pub(crate) slots: Vec<FrameBuffer>,
    pub(crate) avail: VecDeque<usize>,
    pub(crate) pending_alloc: VecDeque<usize>,
    pub(crate) alloc_ready: VecDeque<usize>,
    pub(crate) display_ready: VecDeque<usize>,
    pub(crate) displaying: VecDeque<usize>,
    /// Slots currently leased to the decoder
    pub(crate) leased_slots: Vec<usize>,
    /// Decoder demand; the allocator pass grows the arena toward this
    pub(crate) needed_frames: usize,
    /// Bumped on every flush so stale leases can be detected
    pub(crate) flush_generation: u64,
    /// Handles stripped by a flush, awaiting release on the presentation
    /// thread (GPU-context affinity: the pool never destroys handles itself)
    pub(crate) retired_handles: Vec<GpuHandles>,
}

impl PoolState {
    /// Moves every `displaying` frame back to `avail` for the decoder to
    /// reuse, restoring the write-mapped state. Returns how many moved.
    pub(crate) fn recycle_displaying(&mut self) -> usize {
        let mut recycled = 0;
        while let Some(idx) = self.displaying.pop_front() {
            let slot = &mut self.slots[idx];
            if slot.gpu == GpuHandleState::Uploaded {
                slot.gpu = GpuHandleState::Mapped;
            }
            slot.reset_presentation();
            self.avail.push_back(idx);
            recycled += 1;
        }
        recycled
    }

    fn counts(&self) -> StageCounts {
        StageCounts {
            avail: self.avail.len(),
            pending_alloc: self.pending_alloc.len(),
            alloc_ready: self.alloc_ready.len(),
            display_ready: self.display_ready.len(),
            displaying: self.displaying.len(),
            leased: self.leased_slots.len(),
        }
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    avail_cond: Condvar,
    alloc_done_cond: Condvar,
    shutdown: AtomicBool,
    layout: PlaneLayout,
    config: PoolConfig,
}

/// The frame pool, shared between the decode and presentation threads.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolShared>,
}

impl FramePool {
    /// Creates a pool with `config.initial_frames` empty slots in `avail`.
    pub fn new(layout: PlaneLayout, config: PoolConfig) -> Self {
        let initial = config.initial_frames.min(config.max_frames);
        let slots: Vec<FrameBuffer> = (0..initial).map(|_| FrameBuffer::new(layout)).collect();
        let avail: VecDeque<usize> = (0..initial).collect();
        Self {
            inner: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    slots,
                    avail,
                    pending_alloc: VecDeque::new(),
                    alloc_ready: VecDeque::new(),
                    display_ready: VecDeque::new(),
                    displaying: VecDeque::new(),
                    leased_slots: Vec::new(),
                    needed_frames: initial,
                    flush_generation: 0,
                    retired_handles: Vec::new(),
                }),
                avail_cond: Condvar::new(),
                alloc_done_cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
                layout,
                config,
            }),
        }
    }

    /// The plane layout all slots share.
    pub fn layout(&self) -> PlaneLayout {
        self.inner.layout
    }

    /// Records the decoder's buffer demand, clamped to the high-water mark.
    /// The arena grows on the next allocator pass; it never shrinks except
    /// through [`FramePool::flush`] releasing GPU resources.
    pub fn set_needed_frames(&self, needed: usize) {
        let mut state = self.inner.state.lock();
        state.needed_frames = needed.min(self.inner.config.max_frames);
    }

    /// Blocks the decode thread until an empty buffer is available, routing
    /// it through GPU allocation if it has no mapped staging yet.
    ///
    /// Returns `None` only as a cancellation outcome: pipeline shutdown, or
    /// a flush racing with this call.
    pub fn acquire_for_decode(&self) -> Option<DecodeLease> {
        let shared = &self.inner;
        let mut state = shared.state.lock();
        let entry_generation = state.flush_generation;

        loop {
            if shared.shutdown.load(Ordering::Acquire)
                || state.flush_generation != entry_generation
            {
                return None;
            }

            let Some(idx) = state.avail.pop_front() else {
                shared.avail_cond.wait(&mut state);
                continue;
            };

            // Recycled buffer with a live mapping: hand it straight out.
            if state.slots[idx].gpu == GpuHandleState::Mapped
                && state.slots[idx].staging.is_some()
            {
                return Some(lease_out(&mut state, idx));
            }

            // Needs GPU resources; the presentation thread allocates and
            // maps, then signals through alloc_done_cond.
            state.pending_alloc.push_back(idx);
            loop {
                if shared.shutdown.load(Ordering::Acquire)
                    || state.flush_generation != entry_generation
                {
                    return None;
                }
                if let Some(ready) = state.alloc_ready.pop_front() {
                    return Some(lease_out(&mut state, ready));
                }
                // A failed allocation drops the slot back to avail; start
                // over from the outer loop instead of waiting for a ready
                // buffer that will never come.
                if !state.pending_alloc.contains(&idx) && !state.avail.is_empty() {
                    break;
                }
                shared.alloc_done_cond.wait(&mut state);
            }
        }
    }

    /// Moves a filled buffer to `display_ready`, ordered by submission.
    ///
    /// pts monotonicity is tolerated but not corrected here; the sync engine
    /// handles discontinuities through epoch tagging. A lease that survived
    /// a flush is silently recycled instead of entering the display queue.
    pub fn submit_decoded(&self, lease: DecodeLease, info: FrameInfo) {
        let DecodeLease {
            slot,
            generation,
            region,
            ..
        } = lease;
        let mut state = self.inner.state.lock();
        state.leased_slots.retain(|&s| s != slot);

        let stale = generation != state.flush_generation;
        let buffer = &mut state.slots[slot];
        buffer.staging = Some(region);

        if stale || self.inner.shutdown.load(Ordering::Acquire) {
            tracing::debug!("discarding frame submitted across a flush");
            buffer.reset_presentation();
            state.avail.push_back(slot);
        } else {
            buffer.pts = Some(info.pts);
            buffer.duration = info.duration.max(0);
            buffer.epoch = info.epoch;
            buffer.deinterlace_offset = info.deinterlace_offset;
            state.display_ready.push_back(slot);
        }
        self.inner.avail_cond.notify_all();
    }

    /// Returns a lease without submitting a frame (end of stream, decode
    /// error). The buffer goes back to `avail` with its mapping intact.
    pub fn release_lease(&self, lease: DecodeLease) {
        let DecodeLease { slot, region, .. } = lease;
        let mut state = self.inner.state.lock();
        state.leased_slots.retain(|&s| s != slot);
        state.slots[slot].staging = Some(region);
        state.avail.push_back(slot);
        self.inner.avail_cond.notify_all();
    }

    /// Moves every buffer from every stage back to `avail` and strips GPU
    /// resources (queued for release on the presentation thread).
    ///
    /// Safe to call concurrently with an in-flight
    /// [`FramePool::acquire_for_decode`]; that call wakes with a
    /// cancellation outcome.
    pub fn flush(&self) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.flush_generation = state.flush_generation.wrapping_add(1);
        state.avail.clear();
        state.pending_alloc.clear();
        state.alloc_ready.clear();
        state.display_ready.clear();
        state.displaying.clear();

        for idx in 0..state.slots.len() {
            if let Some(handles) = state.slots[idx].handles.take() {
                state.retired_handles.push(handles);
            }
            let slot = &mut state.slots[idx];
            slot.staging = None;
            slot.gpu = GpuHandleState::Unallocated;
            slot.reset_presentation();
            // Leased slots rejoin `avail` when their stale lease comes back.
            if !state.leased_slots.contains(&idx) {
                state.avail.push_back(idx);
            }
        }

        tracing::debug!(
            frames = state.slots.len(),
            retired = state.retired_handles.len(),
            "pool flushed"
        );
        self.inner.avail_cond.notify_all();
        self.inner.alloc_done_cond.notify_all();
    }

    /// Sets the cooperative cancellation flag and wakes every waiter.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _state = self.inner.state.lock();
        self.inner.avail_cond.notify_all();
        self.inner.alloc_done_cond.notify_all();
    }

    /// Returns true once the pipeline is shutting down.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Per-stage occupancy snapshot.
    pub fn stage_counts(&self) -> StageCounts {
        self.inner.state.lock().counts()
    }

    /// Number of frames queued for display.
    pub fn display_ready_len(&self) -> usize {
        self.inner.state.lock().display_ready.len()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock()
    }

    pub(crate) fn notify_avail(&self) {
        self.inner.avail_cond.notify_all();
    }

    pub(crate) fn notify_alloc_done(&self) {
        self.inner.alloc_done_cond.notify_all();
    }
}

fn lease_out(state: &mut PoolState, idx: usize) -> DecodeLease {
    let generation = state.flush_generation;
    let slot = &mut state.slots[idx];
    slot.reset_presentation();
    let layout = slot.layout;
    let region = slot
        .staging
        .take()
        .unwrap_or_else(|| StagingRegion::new(&layout));
    state.leased_slots.push(idx);
    DecodeLease {
        slot: idx,
        generation,
        region,
        layout,
    }
}
