//! Transport codec
//!
//! Standard base64 with padding, used for audio payloads in both directions.

use crate::error::Result;
use base64::engine::general_purpose;
use base64::Engine;

pub fn encode(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(text)?)
}
