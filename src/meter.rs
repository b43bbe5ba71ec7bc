//! Coarse loudness levels for the level meter
//!
//! Side channel only: levels are derived from the most recent samples on
//! each side and never feed back into capture or playback.

use serde::Serialize;

/// Number of recent samples each level is computed over.
pub const METER_WINDOW: usize = 256;

/// RMS that reads as a full meter.
const FULL_SCALE_RMS: f32 = 0.3;

/// Weight of the previous reading when smoothing.
const SMOOTHING: f32 = 0.5;

/// Input and output levels, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VolumeLevel {
    pub input: f32,
    pub output: f32,
}

/// Instantaneous level of a window of samples.
pub fn level_of(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    (energy.sqrt() / FULL_SCALE_RMS).min(1.0)
}

#[derive(Debug, Default)]
pub struct Meter {
    current: VolumeLevel,
}

impl Meter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the latest windows into the smoothed levels.
    pub fn sample(&mut self, input: &[f32], output: &[f32]) -> VolumeLevel {
        self.current = VolumeLevel {
            input: smooth(self.current.input, level_of(input)),
            output: smooth(self.current.output, level_of(output)),
        };
        self.current
    }

    pub fn reset(&mut self) {
        self.current = VolumeLevel::default();
    }
}

fn smooth(previous: f32, next: f32) -> f32 {
    (SMOOTHING * previous + (1.0 - SMOOTHING) * next).clamp(0.0, 1.0)
}

/// Keeps the tail of the capture stream for the input meter.
#[derive(Debug, Default)]
pub struct RecentSamples {
    samples: Vec<f32>,
}

impl RecentSamples {
    pub fn push(&mut self, chunk: &[f32]) {
        if chunk.len() >= METER_WINDOW {
            self.samples.clear();
            self.samples.extend_from_slice(&chunk[chunk.len() - METER_WINDOW..]);
            return;
        }
        self.samples.extend_from_slice(chunk);
        let excess = self.samples.len().saturating_sub(METER_WINDOW);
        self.samples.drain(..excess);
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}
