//! Audio device seams
//!
//! The session only talks to capture and output hardware through these
//! traits. Backends deliver capture buffers through a callback and report
//! finished playback buffers by id.

#[cfg(feature = "pulse")]
pub mod pulse;

use crate::error::Result;
use crate::playback::PlayableBuffer;
use std::sync::Arc;
use std::time::Duration;

/// One buffer of captured audio at the device rate, mono, in [-1, 1].
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Callback receiving capture buffers in arrival order. Returning `false`
/// asks the device to stop.
pub type CaptureCallback = Box<dyn FnMut(CaptureBuffer) -> bool + Send>;

/// Called by an output sink when a scheduled buffer has played out.
pub type FinishedCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Something that can grant microphone access.
pub trait CaptureDevice: Send + Sync {
    /// Acquire the microphone. Fails with a permission error when access is
    /// denied or no device exists. May block.
    fn open(&self, sample_rate: u32, buffer_frames: usize) -> Result<Box<dyn CaptureStream>>;
}

/// An acquired microphone. Nothing is delivered until [`start`](Self::start).
pub trait CaptureStream: Send {
    fn start(&mut self, deliver: CaptureCallback) -> Result<()>;

    /// Release the microphone. Safe to call more than once.
    fn stop(&mut self);
}

/// Something that can open an audio output.
pub trait OutputDevice: Send + Sync {
    fn open(&self, sample_rate: u32, on_finished: FinishedCallback) -> Result<Box<dyn OutputSink>>;
}

/// An open audio output that plays buffers at session-clock offsets.
pub trait OutputSink: Send {
    /// Queue `buffer` to start at `start` on the session clock.
    fn schedule(&mut self, id: u64, start: Duration, buffer: Arc<PlayableBuffer>) -> Result<()>;

    /// Stop buffer `id` whether or not it has started playing.
    fn stop(&mut self, id: u64);

    /// Release the output. Safe to call more than once.
    fn close(&mut self);
}

/// Capture and output backends used by a session.
#[derive(Clone)]
pub struct Devices {
    pub capture: Arc<dyn CaptureDevice>,
    pub output: Arc<dyn OutputDevice>,
}
