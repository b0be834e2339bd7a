//! Decode-side producer thread.
//!
//! Wraps an external [`FrameSource`] (the codec boundary) in a worker thread
//! that pulls empty buffers from the pool, has the source fill them, and
//! submits the result to the display queue. Control arrives over a channel;
//! seeks flush the pipeline and advance the clock epoch so the sync engine
//! can tell pre-seek frames from post-seek ones.

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use thiserror::Error;

use crate::clock::AudioClock;
use crate::frame::{Epoch, MediaTime, PlaneLayout, StagingRegion};
use crate::frame_pool::{FrameInfo, FramePool};

/// Errors surfaced by the external decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("seek to {0} failed")]
    Seek(MediaTime),
}

/// The external decoder boundary.
///
/// Implementations fill the leased staging region according to the plane
/// layout and report per-frame timing. The pipeline owns the threading; a
/// source only ever runs on the decode thread.
pub trait FrameSource: Send {
    /// Decodes the next picture into `region`. Returns `Ok(None)` at end of
    /// stream. The returned epoch is overridden by the pipeline's current
    /// epoch before submission.
    fn next_frame(
        &mut self,
        region: &mut StagingRegion,
        layout: &PlaneLayout,
    ) -> Result<Option<FrameInfo>, SourceError>;

    /// Repositions the stream. Frames decoded afterwards belong to the new
    /// clock interval.
    fn seek(&mut self, target: MediaTime) -> Result<(), SourceError>;

    /// How many in-flight buffers the source wants the pool to keep; the
    /// pool grows toward this up to its high-water mark.
    fn preferred_depth(&self) -> usize {
        4
    }
}

enum Command {
    Play,
    Pause,
    Seek(MediaTime),
    Stop,
}

/// Owning handle to the decode worker; stops and joins on drop.
pub struct DecodeThread {
    commands: Sender<Command>,
    pool: FramePool,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl DecodeThread {
    /// Spawns the worker. It immediately starts filling buffers.
    pub fn spawn(source: Box<dyn FrameSource>, pool: FramePool, clock: AudioClock) -> Self {
        let (tx, rx) = unbounded();
        let worker_pool = pool.clone();
        let handle = std::thread::spawn(move || decode_loop(source, worker_pool, clock, rx));
        Self {
            commands: tx,
            pool,
            handle: Some(handle),
        }
    }

    /// Resumes decoding after a pause.
    pub fn play(&self) {
        let _ = self.commands.send(Command::Play);
    }

    /// Parks the worker after the frame it is currently filling; buffers
    /// already queued stay queued.
    pub fn pause(&self) {
        let _ = self.commands.send(Command::Pause);
    }

    /// Requests a seek; the pipeline flushes and the clock epoch advances
    /// before the source repositions.
    ///
    /// The flush here runs on the calling thread so a worker blocked in
    /// `acquire_for_decode` wakes up to service the command.
    pub fn seek(&self, target: MediaTime) {
        let _ = self.commands.send(Command::Seek(target));
        self.pool.flush();
    }

    /// Asks the worker to exit and unblocks any wait it is parked in.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        self.pool.shutdown();
    }
}

impl Drop for DecodeThread {
    fn drop(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn decode_loop(
    mut source: Box<dyn FrameSource>,
    pool: FramePool,
    clock: AudioClock,
    commands: Receiver<Command>,
) {
    let layout = pool.layout();
    let mut epoch = clock.epoch();
    let mut paused = false;
    pool.set_needed_frames(source.preferred_depth());
    tracing::debug!(epoch, "decode loop started");

    loop {
        // Control first, so a seek wins over buffered decode work.
        loop {
            match commands.try_recv() {
                Ok(cmd) => {
                    if !handle_command(cmd, source.as_mut(), &pool, &clock, &mut epoch, &mut paused)
                    {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if paused {
            // Park until told otherwise; no buffers are consumed meanwhile.
            match commands.recv() {
                Ok(cmd) => {
                    if !handle_command(cmd, source.as_mut(), &pool, &clock, &mut epoch, &mut paused)
                    {
                        return;
                    }
                    continue;
                }
                Err(_) => return,
            }
        }

        let Some(mut lease) = pool.acquire_for_decode() else {
            if pool.is_shutdown() {
                return;
            }
            // Flush raced the acquire; loop back to pick up the command
            // that caused it.
            continue;
        };

        match source.next_frame(&mut lease.region, &layout) {
            Ok(Some(mut info)) => {
                info.epoch = epoch;
                pool.submit_decoded(lease, info);
            }
            Ok(None) => {
                pool.release_lease(lease);
                // End of stream: park until told to seek or stop.
                match commands.recv() {
                    Ok(cmd) => {
                        if !handle_command(
                            cmd,
                            source.as_mut(),
                            &pool,
                            &clock,
                            &mut epoch,
                            &mut paused,
                        ) {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
            Err(e) => {
                tracing::warn!("dropping frame: {e}");
                pool.release_lease(lease);
            }
        }
    }
}

/// Returns false when the worker should exit.
fn handle_command(
    cmd: Command,
    source: &mut dyn FrameSource,
    pool: &FramePool,
    clock: &AudioClock,
    epoch: &mut Epoch,
    paused: &mut bool,
) -> bool {
    match cmd {
        Command::Play => {
            *paused = false;
            true
        }
        Command::Pause => {
            *paused = true;
            true
        }
        Command::Seek(target) => {
            *epoch = clock.begin_epoch();
            pool.flush();
            if let Err(e) = source.seek(target) {
                tracing::warn!("seek failed: {e}");
            }
            true
        }
        Command::Stop => false,
    }
}
