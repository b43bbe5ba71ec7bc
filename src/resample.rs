//! Resampler/framer for captured audio
//!
//! Converts float capture buffers at the device rate into 16 kHz mono PCM16
//! using nearest-neighbour decimation. There is no interpolation and no
//! anti-aliasing filter: this trades fidelity for cost and is kept that way on
//! purpose. Each buffer is resampled on its own, so the fractional source
//! position is not carried across buffers and phase can drift slightly over
//! many buffers.

use crate::config::INPUT_SAMPLE_RATE;
use crate::protocol::MediaChunk;

/// Convert one float sample to PCM16.
///
/// The sample is clamped to [-1, 1]; negative values scale by 32768 and
/// positive values by 32767, truncating toward zero.
#[inline]
pub fn to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Resample a capture buffer to [`INPUT_SAMPLE_RATE`].
///
/// Output index `i` reads source index `floor(i * input_rate / 16000)`. When
/// that index runs past the end of the buffer the output stops early, so the
/// last partial buffer may come out shorter than `ceil(len * 16000 / rate)`.
pub fn resample(input: &[f32], input_rate: u32) -> Vec<i16> {
    if input_rate == INPUT_SAMPLE_RATE {
        return input.iter().copied().map(to_pcm16).collect();
    }
    if input_rate == 0 || input.is_empty() {
        return Vec::new();
    }

    let ratio = input_rate as f64 / INPUT_SAMPLE_RATE as f64;
    let out_len = (input.len() as f64 / ratio).ceil() as usize;
    let mut out = Vec::with_capacity(out_len);

    for i in 0..out_len {
        let offset = (i as f64 * ratio).floor() as usize;
        if offset >= input.len() {
            break;
        }
        out.push(to_pcm16(input[offset]));
    }

    out
}

/// Little-endian byte layout of PCM16 samples.
pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

/// Resample a capture buffer and wrap it for the wire.
pub fn frame(input: &[f32], input_rate: u32) -> MediaChunk {
    MediaChunk::pcm16(pcm16_to_le_bytes(&resample(input, input_rate)), INPUT_SAMPLE_RATE)
}
