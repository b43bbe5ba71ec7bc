//! Gapless playback scheduling for model audio
//!
//! Each decoded response chunk starts at `max(last scheduled end, now)` on the
//! session clock, so chunks play back-to-back while delivery keeps up and a
//! late chunk starts immediately instead of overlapping. Every scheduled
//! buffer is tracked until it finishes so that an interruption can stop all
//! of them at once.

use crate::clock::Clock;
use crate::device::OutputSink;
use crate::error::{LiveError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Decoded PCM ready for output, one `Vec` per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl PlayableBuffer {
    /// Decode interleaved little-endian PCM16 into normalized floats
    /// (sample / 32768). Trailing samples that do not fill a whole frame are
    /// dropped.
    pub fn decode_pcm16(bytes: &[u8], sample_rate: u32, channels: usize) -> Result<Self> {
        if channels == 0 || sample_rate == 0 {
            return Err(LiveError::Decode(format!(
                "invalid audio format: {} Hz, {} channels",
                sample_rate, channels
            )));
        }
        if bytes.len() % 2 != 0 {
            return Err(LiveError::Decode(format!(
                "PCM16 payload has odd length {}",
                bytes.len()
            )));
        }

        let frame_count = bytes.len() / 2 / channels;
        let mut out = vec![Vec::with_capacity(frame_count); channels];
        for (i, pair) in bytes.chunks_exact(2).take(frame_count * channels).enumerate() {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            out[i % channels].push(sample as f32 / 32768.0);
        }

        Ok(Self {
            sample_rate,
            channels: out,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn duration(&self) -> Duration {
        let nanos = self.frame_count() as u128 * 1_000_000_000 / self.sample_rate as u128;
        Duration::from_nanos(nanos as u64)
    }
}

/// A buffer that has been handed to the output and not yet finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEntry {
    pub id: u64,
    pub start: Duration,
    pub duration: Duration,
}

impl PlaybackEntry {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

struct Scheduled {
    entry: PlaybackEntry,
    buffer: Arc<PlayableBuffer>,
}

pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    clock: Arc<dyn Clock>,
    /// End of the last scheduled buffer; zero after an interruption
    next_start: Duration,
    live: BTreeMap<u64, Scheduled>,
    next_id: u64,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            sink,
            clock,
            next_start: Duration::ZERO,
            live: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Decode and schedule one chunk of response audio.
    ///
    /// Returns `None` for an empty chunk, which is not scheduled.
    pub fn enqueue(&mut self, bytes: &[u8], sample_rate: u32, channels: usize) -> Result<Option<PlaybackEntry>> {
        let buffer = PlayableBuffer::decode_pcm16(bytes, sample_rate, channels)?;
        if buffer.frame_count() == 0 {
            debug!("Skipping empty audio chunk");
            return Ok(None);
        }

        let now = self.clock.now();
        let start = self.next_start.max(now);
        let entry = PlaybackEntry {
            id: self.next_id,
            start,
            duration: buffer.duration(),
        };
        let buffer = Arc::new(buffer);

        self.sink.schedule(entry.id, start, buffer.clone())?;
        self.next_id += 1;
        self.next_start = entry.end();
        self.live.insert(entry.id, Scheduled { entry, buffer });

        debug!(
            "Scheduled buffer {} at {:?} for {:?} ({} live)",
            entry.id,
            entry.start,
            entry.duration,
            self.live.len()
        );
        Ok(Some(entry))
    }

    /// Stop every tracked buffer, started or not, and forget the stale
    /// schedule so the next chunk starts at "now".
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.live.len();
        for id in self.live.keys() {
            self.sink.stop(*id);
        }
        self.live.clear();
        self.next_start = Duration::ZERO;
        if stopped > 0 {
            info!("Interrupted playback, stopped {} buffers", stopped);
        }
        stopped
    }

    /// Self-removal of a buffer that played out.
    pub fn finished(&mut self, id: u64) -> bool {
        self.live.remove(&id).is_some()
    }

    pub fn live(&self) -> impl Iterator<Item = &PlaybackEntry> {
        self.live.values().map(|s| &s.entry)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    /// The last `window` samples (first channel) played before now, empty
    /// when nothing is playing.
    pub fn recent_samples(&self, window: usize) -> Vec<f32> {
        let now = self.clock.now();
        let Some(current) = self
            .live
            .values()
            .find(|s| s.entry.start <= now && now < s.entry.end())
        else {
            return Vec::new();
        };

        let elapsed = (now - current.entry.start).as_secs_f64();
        let position = (elapsed * current.buffer.sample_rate as f64) as usize;
        let samples = &current.buffer.channels[0];
        let end = position.min(samples.len());
        samples[end.saturating_sub(window)..end].to_vec()
    }

    /// Stop everything and release the output.
    pub fn close(&mut self) {
        self.interrupt();
        self.sink.close();
    }
}
