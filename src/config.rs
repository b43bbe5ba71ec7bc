//! Session configuration

use std::time::Duration;

/// Wire sample rate for captured audio
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of the model's audio responses
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Frames per capture buffer delivered by the device
pub const CAPTURE_BUFFER_FRAMES: usize = 4096;

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3000/api/live";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// Persona used when `connect` is called without an instruction.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "\
You are Sakura, a warm and patient Japanese conversation tutor.
Talk with the user in natural, polite everyday Japanese.
Listen closely to the user's Japanese, paying attention to pitch accent, long vowels and \
intonation as well as particles, conjugations and natural phrasing.
Whenever you notice a pronunciation or grammar mistake, call the 'report_feedback' tool with \
the correction and short advice written in Chinese.
Keep spoken replies to one to three sentences so the user keeps talking, and stay encouraging.";

/// How captured audio crosses the duplex channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFraming {
    /// Raw PCM16 bytes in a binary frame; the relay tags and encodes them
    Binary,
    /// `{type: "audio", media: {mimeType, data}}` with a base64 payload
    Json,
}

/// Configuration for a live session
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Relay endpoint that negotiates the remote session
    pub relay_url: String,
    pub model: String,
    pub voice: String,
    /// Overrides [`DEFAULT_SYSTEM_INSTRUCTION`] when `connect` gets `None`
    pub system_instruction: Option<String>,
    pub audio_framing: AudioFraming,
    /// Rate requested from the capture device before resampling
    pub capture_sample_rate: u32,
    pub capture_buffer_frames: usize,
    pub output_sample_rate: u32,
    pub meter_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            system_instruction: None,
            audio_framing: AudioFraming::Binary,
            capture_sample_rate: 48_000,
            capture_buffer_frames: CAPTURE_BUFFER_FRAMES,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            meter_interval: Duration::from_millis(50),
        }
    }
}

impl LiveConfig {
    /// Build a configuration from `KAIWA_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("KAIWA_RELAY_URL") {
            config.relay_url = url.trim().to_string();
        }
        if let Some(instruction) = lookup("KAIWA_SYSTEM_INSTRUCTION") {
            if !instruction.trim().is_empty() {
                config.system_instruction = Some(instruction);
            }
        }
        if let Some(voice) = lookup("KAIWA_VOICE") {
            if !voice.trim().is_empty() {
                config.voice = voice.trim().to_string();
            }
        }
        if let Some(flag) = lookup("KAIWA_JSON_AUDIO") {
            if matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes") {
                config.audio_framing = AudioFraming::Json;
            }
        }

        config
    }

    /// Instruction to send for a connection attempt.
    pub fn instruction_or_default(&self, requested: Option<String>) -> String {
        requested
            .filter(|s| !s.trim().is_empty())
            .or_else(|| self.system_instruction.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_string())
    }
}
