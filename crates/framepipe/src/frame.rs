//! Core frame buffer types.
//!
//! A [`FrameBuffer`] is a single decoded-picture slot: up to three planes of
//! pixel storage (luma plus two chroma), a presentation timestamp, the
//! remaining on-screen time budget, and a clock epoch tag. Buffers live in an
//! arena owned by the frame pool and move between the pipeline stages by
//! index; the CPU-writable staging memory is the only part that travels with
//! the decoder while a buffer is leased out for writing.

use crate::gpu::GpuHandles;

/// Media/clock time in nanoseconds.
pub type MediaTime = i64;

/// Tag identifying one contiguous interval of the audio clock's monotonic
/// progress. Changes on seek/restart.
pub type Epoch = u32;

/// Maximum number of pixel planes (luma + two chroma).
pub const MAX_PLANES: usize = 3;

/// Per-plane dimensions and byte offsets within a staging region.
///
/// Planes are 8-bit, so a plane's byte size is `width * height`. Offsets are
/// recorded by the GPU allocator when the staging region is created and are
/// reused by `upload` to locate each plane inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    /// Plane widths in pixels
    pub widths: [u32; MAX_PLANES],
    /// Plane heights in pixels
    pub heights: [u32; MAX_PLANES],
    /// Byte offset of each plane within the staging region
    pub offsets: [usize; MAX_PLANES],
}

impl PlaneLayout {
    /// Creates a layout from explicit per-plane dimensions, packing the
    /// planes back to back.
    pub fn new(dims: [(u32, u32); MAX_PLANES]) -> Self {
        let widths = [dims[0].0, dims[1].0, dims[2].0];
        let heights = [dims[0].1, dims[1].1, dims[2].1];
        let mut offsets = [0usize; MAX_PLANES];
        offsets[1] = (widths[0] * heights[0]) as usize;
        offsets[2] = offsets[1] + (widths[1] * heights[1]) as usize;
        Self {
            widths,
            heights,
            offsets,
        }
    }

    /// Creates a 4:2:0 layout: full-resolution luma, half-resolution chroma.
    pub fn yuv420(width: u32, height: u32) -> Self {
        let cw = width.div_ceil(2);
        let ch = height.div_ceil(2);
        Self::new([(width, height), (cw, ch), (cw, ch)])
    }

    /// Byte size of a single plane.
    pub fn plane_size(&self, plane: usize) -> usize {
        (self.widths[plane] * self.heights[plane]) as usize
    }

    /// Total byte size of the staging region (sum of the three planes).
    pub fn total_size(&self) -> usize {
        (0..MAX_PLANES).map(|p| self.plane_size(p)).sum()
    }

    /// Luma-plane dimensions (the frame's nominal size).
    pub fn dimensions(&self) -> (u32, u32) {
        (self.widths[0], self.heights[0])
    }
}

/// CPU-writable memory backing a frame's pixel planes prior to GPU upload.
///
/// Stands in for the write-mapped region of the backend's pixel buffer. The
/// decoder writes planes at the offsets recorded in the layout; `upload`
/// transfers them into GPU image storage.
#[derive(Debug)]
pub struct StagingRegion {
    data: Box<[u8]>,
}

impl StagingRegion {
    /// Allocates a zeroed region sized for the given layout.
    pub fn new(layout: &PlaneLayout) -> Self {
        Self {
            data: vec![0u8; layout.total_size()].into_boxed_slice(),
        }
    }

    /// Returns the whole region.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Returns one plane as a mutable slice, located via the layout's
    /// recorded offsets.
    pub fn plane_mut<'a>(&'a mut self, layout: &PlaneLayout, plane: usize) -> &'a mut [u8] {
        let start = layout.offsets[plane];
        let end = start + layout.plane_size(plane);
        &mut self.data[start..end]
    }

    /// Returns one plane as a slice.
    pub fn plane<'a>(&'a self, layout: &PlaneLayout, plane: usize) -> &'a [u8] {
        let start = layout.offsets[plane];
        let end = start + layout.plane_size(plane);
        &self.data[start..end]
    }
}

/// GPU-side state of a frame buffer's resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuHandleState {
    /// No backend objects exist for this buffer
    Unallocated,
    /// Backend objects exist and the staging region is writable
    Mapped,
    /// Planes have been transferred to image storage this cycle
    Uploaded,
}

/// A single decoded-picture slot in the pool's arena.
#[derive(Debug)]
pub struct FrameBuffer {
    /// Plane dimensions and staging offsets
    pub layout: PlaneLayout,
    /// CPU-writable pixel storage. `None` while leased out to the decoder or
    /// before the allocator has created it.
    pub staging: Option<StagingRegion>,
    /// Presentation timestamp, or `None` for the "no timestamp" sentinel
    pub pts: Option<MediaTime>,
    /// Remaining on-screen time budget, consumed as the frame is displayed
    pub duration: i64,
    /// Audio-clock epoch this frame belongs to
    pub epoch: Epoch,
    /// Sub-pixel vertical offset applied when the source is interlaced
    pub deinterlace_offset: f32,
    /// Upload lifecycle state
    pub gpu: GpuHandleState,
    /// Backend object ids, present in `Mapped`/`Uploaded` states
    pub handles: Option<GpuHandles>,
}

impl FrameBuffer {
    /// Creates an empty slot with no pixel storage or GPU resources.
    pub fn new(layout: PlaneLayout) -> Self {
        Self {
            layout,
            staging: None,
            pts: None,
            duration: 0,
            epoch: 0,
            deinterlace_offset: 0.0,
            gpu: GpuHandleState::Unallocated,
            handles: None,
        }
    }

    /// Clears presentation metadata when the buffer returns to the decoder.
    pub fn reset_presentation(&mut self) {
        self.pts = None;
        self.duration = 0;
        self.deinterlace_offset = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuv420_layout_offsets() {
        let layout = PlaneLayout::yuv420(640, 480);
        assert_eq!(layout.plane_size(0), 640 * 480);
        assert_eq!(layout.plane_size(1), 320 * 240);
        assert_eq!(layout.plane_size(2), 320 * 240);
        assert_eq!(layout.offsets, [0, 640 * 480, 640 * 480 + 320 * 240]);
        assert_eq!(layout.total_size(), 640 * 480 + 2 * 320 * 240);
    }

    #[test]
    fn test_yuv420_odd_dimensions_round_up() {
        let layout = PlaneLayout::yuv420(7, 5);
        assert_eq!(layout.widths, [7, 4, 4]);
        assert_eq!(layout.heights, [5, 3, 3]);
    }

    #[test]
    fn test_staging_region_plane_access() {
        let layout = PlaneLayout::yuv420(4, 4);
        let mut region = StagingRegion::new(&layout);
        assert_eq!(region.bytes().len(), layout.total_size());

        region.plane_mut(&layout, 1).fill(0x80);
        assert!(region.plane(&layout, 1).iter().all(|&b| b == 0x80));
        assert!(region.plane(&layout, 0).iter().all(|&b| b == 0));
        assert!(region.plane(&layout, 2).iter().all(|&b| b == 0));
    }
}
