//! Error taxonomy for the live session
//!
//! Acquisition-phase errors (configuration, permission, channel open) are
//! terminal for a connection attempt. Runtime channel errors are terminal for
//! the session. Decode errors are recovered locally by skipping the payload.

/// Coarse classification of a [`LiveError`], used by front ends to decide
/// what to tell the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Permission,
    ChannelOpen,
    ChannelRuntime,
    Decode,
    AudioDevice,
    Serialization,
}

/// Error type for live session operations
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    /// Missing credential or endpoint; the user has to fix configuration
    #[error("Not configured: {0}")]
    Configuration(String),

    /// Microphone access was denied or no capture device is available
    #[error("Microphone unavailable: {0}")]
    Permission(String),

    /// The remote side refused or failed session negotiation
    #[error("Failed to open channel: {0}")]
    ChannelOpen(String),

    /// The channel failed after the session was established
    #[error("Channel error: {0}")]
    ChannelRuntime(String),

    /// An inbound payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// The output device could not be opened or written
    #[error("Audio output error: {0}")]
    AudioDevice(String),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Permission(_) => ErrorKind::Permission,
            Self::ChannelOpen(_) => ErrorKind::ChannelOpen,
            Self::ChannelRuntime(_) => ErrorKind::ChannelRuntime,
            Self::Decode(_) => ErrorKind::Decode,
            Self::AudioDevice(_) => ErrorKind::AudioDevice,
            Self::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Only decode errors leave the session running.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

impl From<base64::DecodeError> for LiveError {
    fn from(e: base64::DecodeError) -> Self {
        LiveError::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
