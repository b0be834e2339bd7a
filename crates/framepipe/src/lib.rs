//! Frame buffer lifecycle and audio/video synchronization for video
//! playback.
//!
//! The crate sits between an external decoder and an external presentation
//! surface. Decoded pictures travel through a five-stage queue pipeline
//! owned by the [`FramePool`]; once per display refresh the [`Presenter`]
//! selects which frame (or blended frame pair) to show, steering playback
//! speed against the shared [`AudioClock`] through a Kalman-filtered drift
//! estimate.
//!
//! Threading model: exactly one decode thread (see [`DecodeThread`]) and one
//! presentation thread, which must own the rendering context and is the only
//! place [`PresentationGpu`] is ever called. The two meet only at the pool's
//! mutex/condvar boundary.
//!
//! ```no_run
//! use framepipe::{
//!     AudioClock, DecodeThread, FramePool, PlaneLayout, PlaybackStats, PoolConfig, Presenter,
//!     SyncConfig,
//! };
//! # fn demo(source: Box<dyn framepipe::FrameSource>, gpu: &mut dyn framepipe::PresentationGpu) {
//! let pool = FramePool::new(PlaneLayout::yuv420(1920, 1080), PoolConfig::default());
//! let clock = AudioClock::new();
//! let decoder = DecodeThread::spawn(source, pool.clone(), clock.clone());
//! let mut presenter = Presenter::new(pool, clock, SyncConfig::default(), PlaybackStats::new());
//!
//! loop {
//!     // Once per display refresh, on the thread owning the GPU context.
//!     let _output = presenter.tick(gpu);
//! }
//! # }
//! ```

pub mod clock;
pub mod decode;
pub mod frame;
pub mod frame_pool;
pub mod gpu;
pub mod metrics;
pub mod presenter;
pub mod sync;

pub use clock::{AudioClock, ClockSample};
pub use decode::{DecodeThread, FrameSource, SourceError};
pub use frame::{Epoch, FrameBuffer, GpuHandleState, MediaTime, PlaneLayout, StagingRegion};
pub use frame_pool::{DecodeLease, FrameInfo, FramePool, PoolConfig, StageCounts};
pub use gpu::{GpuError, GpuHandles, PresentationGpu};
pub use metrics::{PlaybackStats, StatsSnapshot};
pub use presenter::{FrameRef, Presenter, TickOutput};
pub use sync::{compute_blend, BlendPlan, DriftOutcome, DriftTracker, KalmanFilter, SyncConfig};
