//! kaiwa-live - realtime spoken conversation with a remote speech model
//!
//! Microphone audio is resampled to 16 kHz PCM16 and streamed over a duplex
//! channel; the model's spoken replies are decoded and scheduled for gapless
//! playback, with barge-in cancelling anything still queued. Transcripts,
//! a live subtitle, level meters and tutor feedback are published as a
//! [`SessionView`].

#![forbid(unsafe_code)]

pub mod channel;
pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod meter;
pub mod playback;
pub mod protocol;
pub mod resample;
pub mod session;
pub mod transcript;

#[cfg(test)]
mod testing;

pub use channel::{Connector, WsConnector};
pub use config::LiveConfig;
pub use device::Devices;
pub use error::{LiveError, Result};
pub use protocol::FeedbackEvent;
pub use session::{ConnectionState, LiveSession, SessionView};
pub use transcript::{Role, TranscriptItem};
